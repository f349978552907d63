//! Transport Session contract and implementations.
//!
//! A transport carries [`ClientEvent`]s out and reports [`TransportEvent`]s
//! in. Emission is fire-and-forget: the controllers never wait on the
//! network.
//!
//! - [`WsTransport`]: WebSocket client with automatic reconnect
//! - [`MemoryTransport`]: records emitted events in order

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{ClientEvent, EventName, ParticipantId, ServerEvent, ServerFrame};

/// Connection state of a document view's transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events a transport delivers to the view.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection (re)established; carries the id assigned to it.
    Connected(ParticipantId),
    /// Connection lost. The transport keeps trying to reconnect.
    Disconnected,
    Event(ServerEvent),
}

/// Outbound half of a Transport Session.
pub trait Transport {
    /// Queue an event for sending. Never blocks.
    fn emit(&mut self, event: ClientEvent) -> Result<(), TransportError>;

    /// Terminate the session. Idempotent.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
    #[error("Outgoing queue full")]
    Backpressure,
}

/// In-process transport that records everything emitted.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Vec<ClientEvent>,
    closed: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> &[ClientEvent] {
        &self.sent
    }

    pub fn take_sent(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.sent)
    }

    /// Number of emitted events with the given name.
    pub fn count(&self, name: EventName) -> usize {
        self.sent.iter().filter(|e| e.name() == name).count()
    }
}

impl Transport for MemoryTransport {
    fn emit(&mut self, event: ClientEvent) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.sent.push(event);
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn emit(&mut self, event: ClientEvent) -> Result<(), TransportError> {
        (**self).emit(event)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport.
///
/// One background task dials the server, waits for the handshake frame,
/// pumps frames in both directions and re-dials after `reconnect_delay`
/// whenever the connection drops. Events emitted before a handshake
/// (while offline or still connecting) are dropped when it arrives.
pub struct WsTransport {
    url: String,
    outgoing: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
    shutdown: watch::Sender<bool>,
    closed: bool,
}

impl WsTransport {
    /// Start connecting. Must be called inside a tokio runtime.
    pub fn connect(url: impl Into<String>, reconnect_delay: Duration) -> Self {
        let url = url.into();
        let (out_tx, out_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(supervise(
            url.clone(),
            out_rx,
            event_tx,
            shutdown_rx,
            reconnect_delay,
        ));

        Self {
            url,
            outgoing: out_tx,
            event_rx: Some(event_rx),
            shutdown: shutdown_tx,
            closed: false,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WsTransport {
    fn emit(&mut self, event: ClientEvent) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.outgoing.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.shutdown.send(true);
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpExit {
    /// Connection lost; try again.
    Dropped,
    /// Transport closed by its owner.
    Closed,
}

async fn supervise(
    url: String,
    mut outgoing: mpsc::Receiver<ClientEvent>,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
    reconnect_delay: Duration,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                log::debug!("WebSocket connected to {url}");
                let (exit, handshaken) = pump(stream, &mut outgoing, &events, &mut shutdown).await;
                if handshaken && events.send(TransportEvent::Disconnected).await.is_err() {
                    break;
                }
                if exit == PumpExit::Closed {
                    break;
                }
                log::info!("Connection to {url} lost, reconnecting in {reconnect_delay:?}");
            }
            Err(e) => {
                log::warn!("Connecting to {url} failed: {e}");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    log::debug!("Transport for {url} shut down");
}

fn discard_stale(outgoing: &mut mpsc::Receiver<ClientEvent>) -> usize {
    let mut dropped = 0;
    while outgoing.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        log::debug!("Dropped {dropped} events emitted while offline");
    }
    dropped
}

/// Drive one connection until it drops or the transport is closed.
/// Also reports whether the handshake was seen.
async fn pump(
    stream: WsStream,
    outgoing: &mut mpsc::Receiver<ClientEvent>,
    events: &mpsc::Sender<TransportEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> (PumpExit, bool) {
    let (mut writer, mut reader) = stream.split();
    let mut handshaken = false;

    loop {
        tokio::select! {
            frame = reader.next() => {
                match frame {
                    Some(Ok(Message::Binary(data))) => {
                        let event = match ServerFrame::decode(&data) {
                            Ok(ServerFrame::Handshake(id)) => {
                                // The view has not seen this connection yet, so
                                // everything queued so far belongs to the old one.
                                discard_stale(outgoing);
                                handshaken = true;
                                TransportEvent::Connected(id)
                            }
                            Ok(ServerFrame::Event(event)) if handshaken => TransportEvent::Event(event),
                            Ok(ServerFrame::Event(event)) => {
                                log::warn!("Dropping {} received before handshake", event.name());
                                continue;
                            }
                            Err(e) => {
                                log::warn!("Failed to decode server frame: {e}");
                                continue;
                            }
                        };
                        if events.send(event).await.is_err() {
                            // Nobody is listening any more.
                            let _ = writer.close().await;
                            return (PumpExit::Closed, handshaken);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return (PumpExit::Dropped, handshaken),
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {e}");
                        return (PumpExit::Dropped, handshaken);
                    }
                    Some(Ok(_)) => {}
                }
            }

            event = outgoing.recv(), if handshaken => {
                let Some(event) = event else {
                    let _ = writer.close().await;
                    return (PumpExit::Closed, handshaken);
                };
                let name = event.name();
                match event.encode() {
                    Ok(bytes) => {
                        if let Err(e) = writer.send(Message::Binary(bytes.into())).await {
                            log::warn!("Failed to send {name}: {e}");
                            return (PumpExit::Dropped, handshaken);
                        }
                        log::trace!("Sent {name}");
                    }
                    Err(e) => log::error!("Failed to encode {name}: {e}"),
                }
            }

            _ = shutdown.changed() => {
                let _ = writer.close().await;
                return (PumpExit::Closed, handshaken);
            }
        }
    }
}
