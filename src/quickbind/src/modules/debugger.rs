//! Debugger wire endpoints: the DevTools-style discovery endpoints
//! (`/json`, `/json/list`, `/json/version`) and a WebSocket endpoint whose
//! message bodies are opaque to the bridge and forwarded to a pluggable
//! inspector channel.
//!
//! The server runs on its own thread and never touches script state; the
//! channel implementation decides what, if anything, to answer.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context as _;
use serde::Serialize;
use tracing::{debug, info, warn};
use tungstenite::Message;

/// Receives inspector messages; the reply, if any, goes back over the same
/// socket. Implementations must be callable from the debugger thread.
pub trait InspectorChannel: Send + Sync {
    fn on_message(&self, message: &str) -> Option<String>;
}

/// Default channel: log and drop.
pub struct LoggingChannel;

impl InspectorChannel for LoggingChannel {
    fn on_message(&self, message: &str) -> Option<String> {
        debug!(message, "inspector message");
        None
    }
}

#[derive(Serialize)]
struct TargetRecord {
    id: String,
    title: String,
    #[serde(rename = "type")]
    kind: String,
    description: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

#[derive(Serialize)]
struct VersionRecord {
    #[serde(rename = "Browser")]
    browser: String,
    #[serde(rename = "Protocol-Version")]
    protocol_version: String,
}

pub struct DebuggerServer {
    port: u16,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DebuggerServer {
    /// Binds the endpoint and starts serving on a background thread.
    pub fn start(port: u16, channel: Arc<dyn InspectorChannel>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .with_context(|| format!("binding the debugger endpoint on port {port}"))?;
        listener
            .set_nonblocking(true)
            .context("configuring the debugger listener")?;
        // Port zero asks the OS to pick; report the real one.
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(port);

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name(String::from("quickbind-debugger"))
            .spawn(move || serve(&listener, port, &stop_flag, channel.as_ref()))
            .context("spawning the debugger thread")?;

        info!(port, "debugger listening");
        Ok(Self { port, stop, thread: Some(thread) })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DebuggerServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve(listener: &TcpListener, port: u16, stop: &AtomicBool, channel: &dyn InspectorChannel) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "debugger connection");
                if let Err(err) = handle_connection(stream, port, stop, channel) {
                    warn!(%err, "debugger connection failed");
                }
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                warn!(%err, "debugger accept failed");
                return;
            }
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    port: u16,
    stop: &AtomicBool,
    channel: &dyn InspectorChannel,
) -> anyhow::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_millis(500)))?;

    // Decide between the discovery endpoints and a WebSocket upgrade
    // without consuming the stream.
    let mut peeked = [0u8; 1024];
    let n = stream.peek(&mut peeked)?;
    let head = String::from_utf8_lossy(&peeked[..n]);

    if head.to_ascii_lowercase().contains("upgrade: websocket") {
        return pump_websocket(stream, stop, channel);
    }

    // Drain the request before answering.
    let mut request = vec![0u8; n.max(1)];
    let _ = stream.read(&mut request)?;

    let path = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");

    let body = match path {
        "/json" | "/json/list" => serde_json::to_string(&[TargetRecord {
            id: String::from("quickbind-1"),
            title: String::from("quickbind main context"),
            kind: String::from("node"),
            description: String::new(),
            web_socket_debugger_url: format!("ws://127.0.0.1:{port}/"),
        }])?,
        "/json/version" => serde_json::to_string(&VersionRecord {
            browser: format!("quickbind/{}", env!("CARGO_PKG_VERSION")),
            protocol_version: String::from("1.1"),
        })?,
        _ => {
            let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
            stream.write_all(response.as_bytes())?;
            return Ok(());
        }
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())?;
    Ok(())
}

fn pump_websocket(
    stream: TcpStream,
    stop: &AtomicBool,
    channel: &dyn InspectorChannel,
) -> anyhow::Result<()> {
    let mut socket = tungstenite::accept(stream)
        .map_err(|e| anyhow::anyhow!("websocket handshake failed: {e}"))?;
    while !stop.load(Ordering::SeqCst) {
        match socket.read() {
            Ok(Message::Text(text)) => {
                if let Some(reply) = channel.on_message(text.as_str()) {
                    socket.send(Message::text(reply))?;
                }
            }
            Ok(Message::Binary(bytes)) => {
                let text = String::from_utf8_lossy(&bytes);
                if let Some(reply) = channel.on_message(&text) {
                    socket.send(Message::text(reply))?;
                }
            }
            Ok(Message::Ping(payload)) => socket.send(Message::Pong(payload))?,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref err))
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    #[test]
    fn discovery_endpoints_answer_json() {
        let server = DebuggerServer::start(0, Arc::new(LoggingChannel)).unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
        stream
            .write_all(b"GET /json/version HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        let mut reader = std::io::BufReader::new(stream);
        let mut status = String::new();
        reader.read_line(&mut status).unwrap();
        assert!(status.starts_with("HTTP/1.1 200"));
    }
}
