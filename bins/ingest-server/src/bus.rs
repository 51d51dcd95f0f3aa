//! Line-delimited JSON bus front end.
//!
//! Each line is one message:
//! ```text
//! {"topic":"cache/a/b/data/core/weather/surface-based-observations/synop","payload":{"id":"x"}}
//! ```
//! A string payload is forwarded as its raw text; any other JSON value is
//! forwarded serialized.

use ingest_engine::ingress::BusMessage;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;

#[derive(Debug, Deserialize)]
struct Frame {
    topic: String,
    #[serde(default)]
    payload: serde_json::Value,
}

pub fn parse_line(line: &str) -> Result<BusMessage, ServerError> {
    let frame: Frame = serde_json::from_str(line).map_err(|e| ServerError::Frame(e.to_string()))?;
    if frame.topic.is_empty() {
        return Err(ServerError::Frame("empty topic".into()));
    }
    let payload = match frame.payload {
        serde_json::Value::String(s) => s.into_bytes(),
        serde_json::Value::Null => Vec::new(),
        other => other.to_string().into_bytes(),
    };
    Ok(BusMessage::new(frame.topic, payload))
}

pub async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr: addr.to_string(), source })?;
    tracing::info!(addr = %addr, "bus listening");
    Ok(listener)
}

/// Accept connections until cancelled, forwarding every valid line to `bus`.
pub async fn serve(listener: TcpListener, bus: mpsc::Sender<BusMessage>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::info!(peer = %peer, "bus client connected");
                    tokio::spawn(connection(stream, bus.clone(), token.clone()));
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
        }
    }
    tracing::info!("bus listener stopped");
}

async fn connection(stream: TcpStream, bus: mpsc::Sender<BusMessage>, token: CancellationToken) {
    let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match parse_line(&line) {
                Ok(message) => {
                    if bus.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(peer = %peer, error = %e, "line dropped"),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "read failed");
                break;
            }
        }
    }
    tracing::debug!(peer = %peer, "bus client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn object_payload_is_serialized() {
        let m = parse_line(r#"{"topic":"a/b","payload":{"id":1}}"#).unwrap();
        assert_eq!(m.topic, "a/b");
        assert_eq!(m.payload, br#"{"id":1}"#);
    }

    #[test]
    fn string_payload_is_forwarded_raw() {
        let m = parse_line(r#"{"topic":"a/b","payload":"{\"id\":1}"}"#).unwrap();
        assert_eq!(m.payload, br#"{"id":1}"#);
    }

    #[test]
    fn rejects_missing_topic() {
        assert!(parse_line(r#"{"payload":{}}"#).is_err());
        assert!(parse_line(r#"{"topic":"","payload":{}}"#).is_err());
        assert!(parse_line("not json").is_err());
    }

    #[tokio::test]
    async fn forwards_lines_from_a_client() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let server = tokio::spawn(serve(listener, tx, token.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"{\"topic\":\"t/1\",\"payload\":{}}\ngarbage\n\n{\"topic\":\"t/2\",\"payload\":\"x\"}\n")
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().topic, "t/1");
        assert_eq!(rx.recv().await.unwrap().topic, "t/2");

        token.cancel();
        server.await.unwrap();
    }
}
