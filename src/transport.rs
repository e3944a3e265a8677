//! Session transport
//!
//! Owns the single WebSocket to the inference peer and the connection state
//! machine. All outbound producers funnel through one writer task; inbound
//! frames are forwarded raw to the demultiplexer. Nobody else mutates the
//! session state — other components learn about connectivity through the
//! status callback and the teardown marker on the raw channel.

use crate::error::{Result, SessionError};
use crate::wire::{ClientMessage, LiveSetup};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Connection state, owned exclusively by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Error,
    Closed,
}

/// Raw inbound delivery to the demultiplexer. `Closed` doubles as the
/// explicit teardown signal dependent components key their cleanup on.
#[derive(Debug)]
pub enum RawInbound {
    Text(String),
    Closed,
}

pub type StatusCallback = Arc<dyn Fn(SessionState) + Send + Sync>;

struct TransportInner {
    url: String,
    setup: LiveSetup,
    state: Mutex<SessionState>,
    ready: AtomicBool,
    wire_tx: Mutex<Option<UnboundedSender<Message>>>,
    raw_tx: UnboundedSender<RawInbound>,
    status_cb: StatusCallback,
}

impl TransportInner {
    fn set_state(&self, next: SessionState) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        };
        if changed {
            (self.status_cb)(next);
        }
    }

    /// An explicit close wins over any late failure report.
    fn set_state_unless_closed(&self, next: SessionState) {
        {
            let state = self.state.lock().unwrap();
            if *state == SessionState::Closed {
                return;
            }
        }
        self.set_state(next);
    }
}

#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    pub fn new(
        url: String,
        setup: LiveSetup,
        raw_tx: UnboundedSender<RawInbound>,
        status_cb: StatusCallback,
    ) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                url,
                setup,
                state: Mutex::new(SessionState::Idle),
                ready: AtomicBool::new(false),
                wire_tx: Mutex::new(None),
                raw_tx,
                status_cb,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().unwrap()
    }

    /// True once the peer has acknowledged setup.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Open the channel and send the setup message. A call while already
    /// connecting or connected is a no-op, not a second attempt.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                SessionState::Connecting | SessionState::Connected => {
                    debug!("connect() while already {:?}, ignoring", *state);
                    return Ok(());
                }
                _ => *state = SessionState::Connecting,
            }
        }
        (self.inner.status_cb)(SessionState::Connecting);

        info!("connecting to live peer");
        let (ws, _resp) = match connect_async(&self.inner.url).await {
            Ok(ok) => ok,
            Err(e) => {
                error!("connect failed: {}", e);
                self.inner.set_state_unless_closed(SessionState::Error);
                return Err(SessionError::WebSocket(e));
            }
        };

        // close() may have run while the handshake was in flight.
        if self.state() == SessionState::Closed {
            debug!("session closed during connect, dropping socket");
            return Ok(());
        }
        info!("connected, sending setup");

        let (mut sink, mut stream) = ws.split();
        let (wire_tx, mut wire_rx) = mpsc::unbounded_channel::<Message>();
        *self.inner.wire_tx.lock().unwrap() = Some(wire_tx);

        // Single writer: every producer's message is serialized here.
        tokio::spawn(async move {
            while let Some(msg) = wire_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    warn!("outbound write failed: {}", e);
                    break;
                }
            }
            debug!("writer task finished");
        });

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(Message::Text(text)) => {
                        if inner.raw_tx.send(RawInbound::Text(text.to_string())).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(bytes)) => {
                        // The peer occasionally delivers JSON in binary frames.
                        match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => {
                                if inner.raw_tx.send(RawInbound::Text(text)).is_err() {
                                    break;
                                }
                            }
                            Err(_) => {
                                debug!("ignoring non-UTF-8 binary frame ({} bytes)", bytes.len());
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        info!("peer closed the channel: {:?}", frame);
                        inner.ready.store(false, Ordering::SeqCst);
                        inner.set_state(SessionState::Closed);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("channel error: {}", e);
                        inner.ready.store(false, Ordering::SeqCst);
                        inner.set_state_unless_closed(SessionState::Error);
                        break;
                    }
                }
            }
            let _ = inner.raw_tx.send(RawInbound::Closed);
            debug!("reader task finished");
        });

        let setup_msg = ClientMessage::Setup {
            setup: self.inner.setup.clone(),
        };
        self.push_to_wire(&setup_msg)
    }

    /// Peer acknowledged setup: `Connecting -> Connected`, sends unlocked.
    pub fn mark_ready(&self) {
        self.inner.ready.store(true, Ordering::SeqCst);
        self.inner.set_state(SessionState::Connected);
    }

    /// Forward a message to the wire. Business data is refused until setup
    /// completes; holding it until then is the pacer's job, not ours.
    pub fn send(&self, msg: &ClientMessage) -> Result<()> {
        if !matches!(msg, ClientMessage::Setup { .. }) && !self.is_ready() {
            return Err(SessionError::NotReady);
        }
        self.push_to_wire(msg)
    }

    /// Idempotent teardown. Dependent components observe the `Closed`
    /// marker on the raw channel and release their session-scoped state.
    pub fn close(&self) {
        {
            let state = self.inner.state.lock().unwrap();
            if *state == SessionState::Closed {
                return;
            }
        }
        info!("closing session");
        self.inner.ready.store(false, Ordering::SeqCst);

        if let Some(wire) = self.inner.wire_tx.lock().unwrap().take() {
            let _ = wire.send(Message::Close(None));
        }
        self.inner.set_state(SessionState::Closed);
        let _ = self.inner.raw_tx.send(RawInbound::Closed);
    }

    fn push_to_wire(&self, msg: &ClientMessage) -> Result<()> {
        let json = msg.to_wire_json()?;
        let wire = self.inner.wire_tx.lock().unwrap();
        match wire.as_ref() {
            Some(tx) => tx
                .send(Message::text(json))
                .map_err(|_| SessionError::ConnectionClosed),
            None => Err(SessionError::ConnectionClosed),
        }
    }

    /// Transport wired to in-memory channels instead of a socket, for
    /// exercising the state machine and gating without a peer.
    #[cfg(test)]
    pub(crate) fn test_rig(
        raw_tx: UnboundedSender<RawInbound>,
        status_cb: StatusCallback,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let transport = Self::new(
            "wss://test.invalid/live".to_string(),
            LiveSetup::for_session("models/test-live", None, None),
            raw_tx,
            status_cb,
        );
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();
        *transport.inner.wire_tx.lock().unwrap() = Some(wire_tx);
        *transport.inner.state.lock().unwrap() = SessionState::Connecting;
        (transport, wire_rx)
    }
}
