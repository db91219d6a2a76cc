// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::net::SocketAddr;

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use protocol::ServerEvent;

use crate::hub::ConnectionHub;

/// Accept model-list websocket clients until the listener fails.
pub async fn serve(listener: TcpListener, hub: ConnectionHub) -> Result<()> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        debug!("hub: accepted TCP connection from {}", peer_addr);

        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, hub).await {
                warn!("hub connection from {} ended with error: {:?}", peer_addr, e);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, hub: ConnectionHub) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| anyhow!("failed to upgrade websocket from {}: {e}", peer_addr))?;
    let (mut sink, mut rx) = ws_stream.split();

    // writer task owns the sink; the hub only ever sees the channel
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let writer = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to serialise event for {}: {:?}", peer_addr, e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!("hub writer for {} stopping: {:?}", peer_addr, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let id = hub.register(out_tx).await?;
    info!("hub: {} registered as connection {}", peer_addr, id);

    while let Some(msg) = rx.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(e) => {
                    warn!("non UTF-8 binary frame from {}: {}", peer_addr, e);
                    continue;
                }
            },
            Ok(Message::Close(_)) => {
                debug!("hub client {} closed websocket", peer_addr);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!("hub websocket error from {}: {:?}", peer_addr, e);
                break;
            }
        };

        if let Err(e) = hub.handle_client_message(id, &text).await {
            // the writer is gone; nothing more can be delivered
            debug!("hub: connection {} no longer writable: {}", id, e);
            break;
        }
    }

    hub.unregister(id).await;
    // dropping the hub's sender ends the writer once its queue is flushed
    let _ = writer.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    use registry::RegistryService;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn recv_event(client: &mut Client) -> ServerEvent {
        loop {
            let msg = timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn end_to_end_init_add_and_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.json");
        std::fs::write(&path, r#"{"official": ["gpt-4o"], "custom": []}"#).unwrap();
        let hub = ConnectionHub::new(RegistryService::open(&path).unwrap());
        hub.attach();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, hub.clone()));
        let url = format!("ws://{addr}");

        let (mut alice, _) = connect_async(&url).await.unwrap();
        let (mut bob, _) = connect_async(&url).await.unwrap();

        for client in [&mut alice, &mut bob] {
            match recv_event(client).await {
                ServerEvent::Init { data } => {
                    assert_eq!(data.official, vec!["gpt-4o"]);
                    assert_eq!(data.version, 0);
                }
                other => panic!("expected init, got {other:?}"),
            }
        }

        alice
            .send(Message::Text(
                r#"{"type": "add_model", "name": "qwen/qwen3-8b", "category": "custom"}"#.into(),
            ))
            .await
            .unwrap();

        for client in [&mut alice, &mut bob] {
            match recv_event(client).await {
                ServerEvent::ModelAdded { data } => {
                    assert_eq!(data.custom, vec!["qwen/qwen3-8b"]);
                    assert_eq!(data.version, 1);
                }
                other => panic!("expected model_added, got {other:?}"),
            }
        }

        bob.send(Message::Text(r#"{"type": "add_model", "name": "x"}"#.into()))
            .await
            .unwrap();
        match recv_event(&mut bob).await {
            ServerEvent::Error { error } => assert!(error.starts_with("Invalid model name")),
            other => panic!("expected error, got {other:?}"),
        }

        bob.close(None).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while hub.connection_count().await != 1 {
            assert!(tokio::time::Instant::now() < deadline, "bob was never unregistered");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
