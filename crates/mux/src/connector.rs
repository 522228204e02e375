//! Socket seam. The driver only sees text messages in and out.

use futures::{SinkExt, StreamExt};
use kmirror_core::MirrorError;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// One established connection. The link is closed once `rx` yields `None`;
/// dropping `tx` closes the socket.
pub struct Link {
    pub tx: mpsc::UnboundedSender<String>,
    pub rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Link, MirrorError>;
}

/// tokio-tungstenite connector with one reader and one writer task per socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Link, MirrorError> {
        let (ws, _resp) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| MirrorError::Transport(format!("connect {url}: {e}")))?;
        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::text(text)).await {
                    warn!(error = %e, "mux: socket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(t)) => t.as_str().to_string(),
                    Ok(Message::Binary(b)) => match String::from_utf8(b.to_vec()) {
                        Ok(t) => t,
                        Err(_) => {
                            warn!(len = b.len(), "mux: dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "mux: socket read failed");
                        break;
                    }
                };
                if in_tx.send(text).is_err() {
                    break;
                }
            }
            debug!("mux: socket reader finished");
        });

        Ok(Link { tx: out_tx, rx: in_rx })
    }
}
