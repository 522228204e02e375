#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use kmirror_core::{Credentials, Frame, StaticCredentials};
use kmirror_stream::{connect, StreamRequest, StreamState, BEARER_PROTOCOL_PREFIX, BINARY_PROTOCOL, USER_PROTOCOL_PREFIX};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

/// Accepts connections forever; each one gets two JSON frames around a junk
/// frame and is then closed. Requested protocol lists are reported on `seen`.
async fn flaky_server(seen: mpsc::UnboundedSender<String>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut n = 0u32;
        while let Ok((tcp, _)) = listener.accept().await {
            n += 1;
            let seen = seen.clone();
            let callback = move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                let header = req
                    .headers()
                    .get("Sec-WebSocket-Protocol")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let first = header.split(',').next().unwrap_or("").trim().to_string();
                let _ = seen.send(header);
                if !first.is_empty() {
                    resp.headers_mut().insert("Sec-WebSocket-Protocol", HeaderValue::from_str(&first).unwrap());
                }
                Ok(resp)
            };
            let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await else { continue };
            let conn = n;
            tokio::spawn(async move {
                let _ = ws.send(Message::text(format!("{{\"conn\":{conn},\"seq\":1}}"))).await;
                let _ = ws.send(Message::text("{definitely not json")).await;
                let _ = ws.send(Message::text(format!("{{\"conn\":{conn},\"seq\":2}}"))).await;
                let _ = ws.close(None).await;
            });
        }
    });
    format!("ws://{addr}/clusters/main/api/v1/pods?watch=1")
}

async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Frame>) -> serde_json::Value {
    match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.expect("timed out").expect("closed") {
        Frame::Json(v) => v,
        other => panic!("unexpected frame {:?}", other),
    }
}

#[tokio::test]
async fn sends_credentials_as_subprotocols() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let url = flaky_server(seen_tx).await;
    let creds: Arc<dyn Credentials> = Arc::new(StaticCredentials::new(Some("s3cret".into()), Some("bob".into())));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = connect(StreamRequest::new(url).cluster("main").json().reconnect(false), creds, tx, None);

    let header = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap().unwrap();
    let protocols: Vec<&str> = header.split(", ").collect();
    assert_eq!(protocols[0], BINARY_PROTOCOL);
    assert_eq!(protocols[1], format!("{BEARER_PROTOCOL_PREFIX}czNjcmV0"));
    assert_eq!(protocols[2], format!("{USER_PROTOCOL_PREFIX}Ym9i"));

    assert_eq!(next_frame(&mut rx).await["seq"], 1);
    handle.cancel();
}

#[tokio::test]
async fn drops_junk_and_reconnects_after_close() {
    let (seen_tx, _seen_rx) = mpsc::unbounded_channel();
    let url = flaky_server(seen_tx).await;
    let creds: Arc<dyn Credentials> = Arc::new(StaticCredentials::default());
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&failures);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let req = StreamRequest::new(url).json().reconnect(true).retry_delay(Duration::from_millis(20));
    let handle = connect(req, creds, tx, Some(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })));

    let a = next_frame(&mut rx).await;
    let b = next_frame(&mut rx).await;
    assert_eq!((a["conn"].as_u64(), a["seq"].as_u64()), (Some(1), Some(1)));
    assert_eq!((b["conn"].as_u64(), b["seq"].as_u64()), (Some(1), Some(2)));

    // Same URL again after the server hung up.
    let c = next_frame(&mut rx).await;
    assert_eq!((c["conn"].as_u64(), c["seq"].as_u64()), (Some(2), Some(1)));
    assert!(failures.load(Ordering::SeqCst) >= 1);

    handle.cancel();
    handle.cancel();
    let mut state = handle.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == StreamState::Closed))
        .await
        .unwrap()
        .unwrap();
    assert!(!handle.is_open());
}

#[tokio::test]
async fn failure_hook_disables_reconnect_by_default() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let url = flaky_server(seen_tx).await;
    let creds: Arc<dyn Credentials> = Arc::new(StaticCredentials::default());
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&failures);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let req = StreamRequest::new(url).json().retry_delay(Duration::from_millis(10));
    let _handle = connect(req, creds, tx, Some(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })));

    assert_eq!(next_frame(&mut rx).await["seq"], 1);
    assert_eq!(next_frame(&mut rx).await["seq"], 2);
    // The loop exits after the close, dropping the sender.
    assert!(tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().is_none());
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    seen_rx.recv().await.unwrap();
    assert!(seen_rx.try_recv().is_err());
}
