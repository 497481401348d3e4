//! Native WebSocket transport.
//!
//! The socket lives on a background thread. The editor thread hands it text
//! frames through a channel and drains received frames with
//! [`NativeWebSocket::poll_events`] once per frame, so neither side blocks.

use crate::sync::ConnectionState;
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tungstenite::{Message, connect};
use url::Url;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Invalid WebSocket URL: {0}")]
    InvalidUrl(String),
    /// `wss://` URLs. The transport is built without TLS.
    #[error("TLS is not supported: {0}")]
    TlsUnsupported(String),
    #[error("Already connected")]
    AlreadyConnected,
    #[error("Not connected")]
    NotConnected,
}

/// What the socket thread reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    /// One inbound text frame.
    Message(String),
    Error(String),
}

/// Commands sent to the WebSocket thread.
enum WsCommand {
    Send(String),
    Close,
}

/// Cut a frame down for log lines.
fn preview(text: &str) -> &str {
    match text.char_indices().nth(100) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// WebSocket client backed by a background thread.
pub struct NativeWebSocket {
    state: ConnectionState,
    cmd_tx: Option<Sender<WsCommand>>,
    event_rx: Option<Receiver<TransportEvent>>,
    _thread: Option<JoinHandle<()>>,
}

impl NativeWebSocket {
    /// Create a new disconnected client.
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            cmd_tx: None,
            event_rx: None,
            _thread: None,
        }
    }

    /// Start connecting. Progress arrives through [`Self::poll_events`].
    pub fn connect(&mut self, url: &str) -> Result<(), TransportError> {
        if self.cmd_tx.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        let parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        match parsed.scheme() {
            "ws" => {}
            "wss" => return Err(TransportError::TlsUnsupported(url.to_string())),
            other => {
                return Err(TransportError::InvalidUrl(format!("unsupported scheme {other}")));
            }
        }

        self.state = ConnectionState::Connecting;
        let (cmd_tx, cmd_rx) = channel::<WsCommand>();
        let (event_tx, event_rx) = channel::<TransportEvent>();
        let url = url.to_string();

        let handle = thread::spawn(move || run_socket(url, cmd_rx, event_tx));

        self.cmd_tx = Some(cmd_tx);
        self.event_rx = Some(event_rx);
        self._thread = Some(handle);
        Ok(())
    }

    /// Ask the socket thread to close and forget it.
    pub fn disconnect(&mut self) {
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(WsCommand::Close);
        }
        self.event_rx = None;
        self._thread = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Queue a text frame for the socket thread.
    pub fn send(&self, text: &str) -> Result<(), TransportError> {
        let tx = self.cmd_tx.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(WsCommand::Send(text.to_string()))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Drain events reported since the last call (non-blocking).
    pub fn poll_events(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        if let Some(rx) = &self.event_rx {
            while let Ok(event) = rx.try_recv() {
                match &event {
                    TransportEvent::Connected => self.state = ConnectionState::Connected,
                    TransportEvent::Disconnected => self.state = ConnectionState::Disconnected,
                    TransportEvent::Error(_) => self.state = ConnectionState::Error,
                    TransportEvent::Message(_) => {}
                }
                events.push(event);
            }
        }
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Error
        ) {
            // The thread is gone; allow a fresh connect.
            self.cmd_tx = None;
            self.event_rx = None;
            self._thread = None;
        }
        events
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

impl Default for NativeWebSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NativeWebSocket {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn run_socket(url: String, cmd_rx: Receiver<WsCommand>, event_tx: Sender<TransportEvent>) {
    log::info!("WebSocket thread: connecting to {url}");
    let (mut socket, response) = match connect(url.as_str()) {
        Ok(pair) => pair,
        Err(e) => {
            log::error!("WebSocket connection failed: {e}");
            let _ = event_tx.send(TransportEvent::Error(format!("Connection failed: {e}")));
            return;
        }
    };
    log::info!("WebSocket connected, status: {}", response.status());
    let _ = event_tx.send(TransportEvent::Connected);

    // A short read timeout turns the blocking read into a poll.
    match socket.get_mut() {
        tungstenite::stream::MaybeTlsStream::Plain(tcp) => {
            let _ = tcp.set_read_timeout(Some(Duration::from_millis(50)));
            let _ = tcp.set_write_timeout(Some(Duration::from_secs(5)));
        }
        #[allow(unreachable_patterns)]
        _ => log::debug!("Non-plain stream, using default timeouts"),
    }

    loop {
        match cmd_rx.try_recv() {
            Ok(WsCommand::Send(text)) => {
                log::debug!("WebSocket sending: {}", preview(&text));
                if let Err(e) = socket.send(Message::text(text)) {
                    log::error!("WebSocket send error: {e}");
                    let _ = event_tx.send(TransportEvent::Error(e.to_string()));
                    break;
                }
            }
            Ok(WsCommand::Close) => {
                log::info!("WebSocket close requested");
                let _ = socket.close(None);
                break;
            }
            Err(TryRecvError::Disconnected) => {
                log::info!("WebSocket command channel disconnected");
                break;
            }
            Err(TryRecvError::Empty) => {}
        }

        match socket.read() {
            Ok(Message::Text(text)) => {
                log::debug!("WebSocket received: {}", preview(&text));
                let _ = event_tx.send(TransportEvent::Message(text.to_string()));
            }
            Ok(Message::Ping(data)) => {
                let _ = socket.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => {
                log::info!("WebSocket received close frame");
                break;
            }
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::error!("WebSocket read error: {e}");
                break;
            }
        }
    }

    log::info!("WebSocket thread exiting");
    let _ = event_tx.send(TransportEvent::Disconnected);
}
