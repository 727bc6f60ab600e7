//! WebSocket transport with automatic reconnect.
//!
//! Provides:
//! - Connection lifecycle (connect, reconnect after a drop, shutdown)
//! - Text frame send/receive
//! - Open/close notifications for the pad
//!
//! The pad never touches the socket. It talks to a [`TransportLink`]: an
//! outgoing frame sender and an incoming [`TransportEvent`] receiver. The
//! transport task keeps reconnecting until the outgoing sender is dropped,
//! which is how a pad shuts its transport down for good.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Connection state as seen by the pad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    Reconnecting,
}

/// Events emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection established; frames can be sent.
    Opened,
    /// Text frame from the server.
    Message(String),
    /// Connection lost. The transport reconnects on its own.
    Closed,
}

/// The pad's end of a transport.
pub struct TransportLink {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// The far end of an in-memory link, for driving a pad without a socket.
pub struct LinkPeer {
    pub outgoing: mpsc::UnboundedReceiver<String>,
    pub events: mpsc::Sender<TransportEvent>,
}

impl TransportLink {
    /// Create a connected in-memory pair.
    pub fn pair(capacity: usize) -> (TransportLink, LinkPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(capacity);
        (
            TransportLink {
                outgoing: out_tx,
                events: event_rx,
            },
            LinkPeer {
                outgoing: out_rx,
                events: event_tx,
            },
        )
    }
}

/// WebSocket transport.
pub struct WsTransport;

impl WsTransport {
    /// Spawn the connection task for `url`.
    pub fn spawn(url: impl Into<String>, reconnect_delay: Duration) -> TransportLink {
        let (link, peer) = TransportLink::pair(256);
        let url = url.into();
        tokio::spawn(async move {
            run(url, reconnect_delay, peer).await;
        });
        link
    }
}

async fn run(url: String, reconnect_delay: Duration, peer: LinkPeer) {
    let LinkPeer {
        outgoing: mut out_rx,
        events,
    } = peer;

    loop {
        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => {
                log::info!("Connected to {url}");
                let (mut ws_writer, mut ws_reader) = ws_stream.split();
                if events.send(TransportEvent::Opened).await.is_err() {
                    return;
                }

                loop {
                    tokio::select! {
                        out = out_rx.recv() => match out {
                            Some(text) => {
                                if let Err(e) = ws_writer.send(Message::Text(text.into())).await {
                                    log::warn!("Send to {url} failed: {e}");
                                    break;
                                }
                            }
                            None => {
                                // pad is gone: close for good
                                let _ = ws_writer.close().await;
                                log::info!("Transport to {url} shut down");
                                return;
                            }
                        },
                        msg = ws_reader.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                if events.send(TransportEvent::Message(text.to_string())).await.is_err() {
                                    return;
                                }
                            }
                            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                                Ok(text) => {
                                    if events.send(TransportEvent::Message(text)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(_) => log::warn!("Dropping non-UTF-8 frame from {url}"),
                            },
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {url}: {e}");
                                break;
                            }
                            _ => {}
                        },
                    }
                }

                log::info!("Connection to {url} lost");
                if events.send(TransportEvent::Closed).await.is_err() {
                    return;
                }
            }
            Err(e) => log::debug!("Connect to {url} failed: {e}"),
        }

        // wait out the reconnect delay, discarding frames queued while down
        let backoff = tokio::time::sleep(reconnect_delay);
        tokio::pin!(backoff);
        loop {
            tokio::select! {
                _ = &mut backoff => break,
                out = out_rx.recv() => match out {
                    Some(_) => log::trace!("Dropping frame while disconnected from {url}"),
                    None => return,
                },
            }
        }
    }
}
