use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kmirror_api::{ApiEndpoint, Client, ListUpdate, ListWatch, QueryParams, Resource};
use kmirror_core::{Credentials, Settings, StaticCredentials};
use rustc_hash::FxHashMap;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kmirrorctl", version, about = "Mirror Kubernetes resources through a kmirror backend")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Cluster name as known to the backend proxy
    #[arg(long = "cluster", global = true, env = "KMIRROR_CLUSTER", default_value = "main")]
    cluster: String,

    /// Namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// apiVersion of the resource, e.g. "v1" or "apps/v1"
    #[arg(long = "api-version", global = true, default_value = "v1")]
    api_version: String,

    /// The resource is cluster-scoped (nodes, namespaces, ...)
    #[arg(long = "cluster-scoped", global = true, action = ArgAction::SetTrue)]
    cluster_scoped: bool,

    /// Share one socket across watches (overrides KMIRROR_MULTIPLEXER)
    #[arg(long = "multiplex", global = true, action = ArgAction::SetTrue)]
    multiplex: bool,

    /// Print the first snapshot and exit
    #[arg(long = "once", global = true, action = ArgAction::SetTrue)]
    once: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List a collection and follow changes
    List {
        /// Plural resource name, e.g. "pods"
        resource: String,
        #[arg(long = "label-selector", short = 'l')]
        label_selector: Option<String>,
        #[arg(long = "field-selector")]
        field_selector: Option<String>,
        /// Keep only the newest N objects
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
    /// Get one object and follow changes
    Get {
        resource: String,
        name: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KMIRROR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KMIRROR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KMIRROR_METRICS_ADDR; expected host:port");
        }
    }
}

fn display_key(r: &Resource) -> String {
    match r.namespace() {
        Some(ns) => format!("{}/{}", ns, r.name().unwrap_or("-")),
        None => r.name().unwrap_or("-").to_string(),
    }
}

/// Prints the difference between consecutive snapshots.
#[derive(Default)]
struct Printer {
    seen: FxHashMap<String, (String, String)>,
}

impl Printer {
    fn print(&mut self, items: &[Arc<Resource>], output: Output) -> Result<()> {
        if output == Output::Json {
            let docs: Vec<&Resource> = items.iter().map(|r| r.as_ref()).collect();
            println!("{}", serde_json::to_string(&docs)?);
            return Ok(());
        }
        let mut next: FxHashMap<String, (String, String)> = FxHashMap::default();
        for r in items {
            let Some(uid) = r.uid() else { continue };
            let rv = r.resource_version().unwrap_or("").to_string();
            let key = display_key(r);
            if self.seen.get(uid).map(|(prev, _)| prev != &rv).unwrap_or(true) {
                println!("+ {}@{}", key, rv);
            }
            next.insert(uid.to_string(), (rv, key));
        }
        for (uid, (_, key)) in &self.seen {
            if !next.contains_key(uid) {
                println!("- {}", key);
            }
        }
        self.seen = next;
        Ok(())
    }
}

async fn follow(mut lw: ListWatch, output: Output, once: bool) -> Result<()> {
    let mut printer = Printer::default();
    loop {
        tokio::select! {
            upd = lw.rx.recv() => match upd {
                Some(ListUpdate::Items(items)) => {
                    printer.print(&items, output)?;
                    if once {
                        break;
                    }
                }
                Some(ListUpdate::Error(e)) => {
                    warn!(error = %e, status = ?e.status(), "watch error");
                    eprintln!("error: {}", e);
                    if once {
                        break;
                    }
                }
                None => {
                    warn!("update channel closed; exiting watch loop");
                    break;
                }
            },
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down watch loop");
                break;
            }
        }
    }
    lw.cancel.cancel();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if cli.multiplex {
        settings.multiplexer = true;
    }
    let creds: Arc<dyn Credentials> = Arc::new(StaticCredentials::new(settings.token.clone(), settings.user_id.clone()));
    let client = Client::new(settings, creds).context("creating client")?;
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::List { resource, label_selector, field_selector, limit } => {
            let endpoint = ApiEndpoint::from_api_version(&cli.api_version, resource, !cli.cluster_scoped);
            let mut query = QueryParams::new();
            if let Some(s) = label_selector {
                query = query.label_selector(s);
            }
            if let Some(s) = field_selector {
                query = query.field_selector(s);
            }
            if let Some(n) = limit {
                query = query.limit(n);
            }
            info!(cluster = %cli.cluster, path = %endpoint.collection_path(ns), transport = client.transport().name(), "list invoked");
            let lw = client.watch_list(&cli.cluster, &endpoint, ns, query);
            follow(lw, cli.output, cli.once).await?;
        }
        Commands::Get { resource, name } => {
            let endpoint = ApiEndpoint::from_api_version(&cli.api_version, resource, !cli.cluster_scoped);
            info!(cluster = %cli.cluster, path = %endpoint.object_path(ns, &name), "get invoked");
            let lw = client.watch_object(&cli.cluster, &endpoint, ns, &name, QueryParams::new());
            follow(lw, cli.output, cli.once).await?;
        }
    }
    Ok(())
}
