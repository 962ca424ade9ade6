//! Thread-per-connection LMTP listener
//!
//! Reads with `std::io`, one OS thread per client. Coordinator calls are
//! run on a tokio runtime handle.

use crate::delivery::DeliveryCoordinator;
use crate::lmtp::framer::{FramedMessage, FramerError, MessageFramer};
use crate::lmtp::protocol::{Action, Response, Session, SessionConfig, State};
use crate::lmtp::reply::{Reply, ReplyContext};
use anyhow::{anyhow, Result};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

enum Conn {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Conn::Plain(s) => s.read(buf),
            Conn::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Conn::Plain(s) => s.write(buf),
            Conn::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Conn::Plain(s) => s.flush(),
            Conn::Tls(s) => s.flush(),
        }
    }
}

enum Input {
    Line(String),
    Message(FramedMessage),
    Eof,
    Idle,
    TooLong,
}

/// LMTP server on OS threads
pub struct BlockingLmtpServer {
    coordinator: Arc<DeliveryCoordinator>,
    tls: Option<Arc<ServerConfig>>,
    runtime: Handle,
    active: Arc<AtomicUsize>,
}

impl BlockingLmtpServer {
    pub fn new(
        coordinator: Arc<DeliveryCoordinator>,
        tls: Option<Arc<ServerConfig>>,
        runtime: Handle,
    ) -> Self {
        Self {
            coordinator,
            tls,
            runtime,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind `lmtp.blocking_port` and serve on the calling thread
    pub fn run(self: Arc<Self>) -> Result<()> {
        let config = self.coordinator.config().get();
        let port = config
            .lmtp
            .blocking_port
            .ok_or_else(|| anyhow!("lmtp.blocking_port is not configured"))?;
        let listener = TcpListener::bind((config.lmtp.host.as_str(), port))?;
        self.serve(listener)
    }

    pub fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "Blocking LMTP server listening");

        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "Failed to accept LMTP connection");
                    continue;
                }
            };
            let peer = stream
                .peer_addr()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));

            let metrics = self.coordinator.metrics();
            let max_connections = self.coordinator.config().get().lmtp.max_connections;
            if self.active.fetch_add(1, Ordering::SeqCst) >= max_connections {
                self.active.fetch_sub(1, Ordering::SeqCst);
                warn!(peer = %peer, "Max connections reached, rejecting");
                metrics.rejected_connections.inc();
                continue;
            }
            metrics.connections.with_label_values(&["blocking"]).inc();

            let server = Arc::clone(&self);
            let spawned = std::thread::Builder::new()
                .name(format!("lmtp-{}", peer))
                .spawn(move || {
                    let metrics = server.coordinator.metrics().clone();
                    metrics.active_connections.inc();
                    if let Err(e) = server.handle_connection(stream, peer) {
                        warn!(peer = %peer, error = %e, "LMTP session error");
                    }
                    metrics.active_connections.dec();
                    server.active.fetch_sub(1, Ordering::SeqCst);
                });
            if let Err(e) = spawned {
                self.active.fetch_sub(1, Ordering::SeqCst);
                error!(peer = %peer, error = %e, "Failed to spawn connection thread");
            }
        }
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        debug!(peer = %peer, "New LMTP connection");
        let config = self.coordinator.config().get();
        let max_line_length = config.lmtp.max_line_length;
        let idle = Duration::from_secs(config.lmtp.idle_timeout_secs);
        stream.set_read_timeout(Some(idle).filter(|d| !d.is_zero()))?;

        let mut session = Session::new(SessionConfig::from_config(&config, self.tls.is_some()));
        let ctx = session.reply_context();
        let mut reader = BufReader::new(Conn::Plain(stream));
        write(&mut reader, &session.greeting(), &ctx)?;

        loop {
            let input = if session.state() == State::ReceivingData {
                read_data(&mut reader, session.max_message_size())?
            } else {
                read_line(&mut reader, max_line_length)?
            };

            let (response, action) = match input {
                Input::Idle => {
                    info!(peer = %peer, "Idle timeout, closing connection");
                    write(&mut reader, &session.idle_timeout(), &ctx)?;
                    break;
                }
                Input::Eof => {
                    if session.state() == State::ReceivingData {
                        info!(peer = %peer, "Connection closed during DATA");
                        session.data_aborted();
                    } else {
                        debug!(peer = %peer, "Connection closed by client");
                    }
                    break;
                }
                Input::TooLong => {
                    warn!(peer = %peer, limit = max_line_length, "Command line too long, closing connection");
                    write(&mut reader, &Response::Single(Reply::SYNTAX_ERROR), &ctx)?;
                    break;
                }
                Input::Line(line) => {
                    debug!(peer = %peer, command = %line, "LMTP command");
                    session.command(&line)
                }
                Input::Message(message) => session.data_received(message),
            };

            match action {
                Action::None | Action::ReceiveData => write(&mut reader, &response, &ctx)?,
                Action::CheckRecipient(mut address) => {
                    let status = self.runtime.block_on(self.coordinator.status(&mut address));
                    let response = session.recipient_checked(address, status);
                    write(&mut reader, &response, &ctx)?;
                }
                Action::Deliver(mut envelope, body) => {
                    match self.runtime.block_on(self.coordinator.deliver(&mut envelope, body)) {
                        Ok(replies) => {
                            let response = session.delivered(replies);
                            write(&mut reader, &response, &ctx)?;
                        }
                        Err(e) => {
                            error!(peer = %peer, error = %e, "Dropping connection");
                            session.data_aborted();
                            break;
                        }
                    }
                }
                Action::StartTls => {
                    let Some(tls) = self.tls.as_ref() else {
                        write(&mut reader, &Response::Single(Reply::STARTTLS_NOT_AVAILABLE), &ctx)?;
                        continue;
                    };
                    write(&mut reader, &response, &ctx)?;
                    reader = upgrade(reader, tls)?;
                    session.tls_established();
                    debug!(peer = %peer, "TLS established");
                }
                Action::Close => {
                    write(&mut reader, &response, &ctx)?;
                    break;
                }
            }
        }

        debug!(peer = %peer, "LMTP connection closed");
        Ok(())
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// One command line without its terminator. A partial line at EOF is dropped.
fn read_line(reader: &mut BufReader<Conn>, max_line_length: usize) -> io::Result<Input> {
    let mut buf = Vec::new();
    let limit = max_line_length as u64 + 1;
    match reader.by_ref().take(limit).read_until(b'\n', &mut buf) {
        Ok(0) => return Ok(Input::Eof),
        Ok(_) => {}
        Err(e) if is_timeout(&e) => return Ok(Input::Idle),
        Err(e) => return Err(e),
    }

    if buf.last() != Some(&b'\n') {
        if buf.len() > max_line_length {
            return Ok(Input::TooLong);
        }
        return Ok(Input::Eof);
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Input::Line(String::from_utf8_lossy(&buf).into_owned()))
}

/// Pull the DATA payload through the framer one byte at a time
fn read_data(reader: &mut BufReader<Conn>, limit: usize) -> io::Result<Input> {
    let mut framer = MessageFramer::with_limit(limit);
    let mut byte = [0u8; 1];
    while !framer.is_complete() {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(Input::Eof),
            Ok(_) => {
                framer.push_byte(byte[0]);
            }
            Err(e) if is_timeout(&e) => return Ok(Input::Idle),
            Err(e) => return Err(e),
        }
    }
    match framer.finish() {
        Ok(message) => Ok(Input::Message(message)),
        Err(FramerError::PrematureEof) => Ok(Input::Eof),
    }
}

fn write(reader: &mut BufReader<Conn>, response: &Response, ctx: &ReplyContext) -> io::Result<()> {
    let text = response.render(ctx);
    if text.is_empty() {
        return Ok(());
    }
    let conn = reader.get_mut();
    conn.write_all(text.as_bytes())?;
    conn.flush()
}

/// Wrap the socket in a server-side TLS session. Plaintext pipelined after
/// STARTTLS is discarded.
fn upgrade(reader: BufReader<Conn>, config: &Arc<ServerConfig>) -> Result<BufReader<Conn>> {
    if !reader.buffer().is_empty() {
        warn!(bytes = reader.buffer().len(), "Discarding plaintext sent after STARTTLS");
    }
    let tcp = match reader.into_inner() {
        Conn::Plain(tcp) => tcp,
        Conn::Tls(_) => return Err(anyhow!("TLS is already active")),
    };
    let mut conn = ServerConnection::new(Arc::clone(config))?;
    let mut tcp = tcp;
    while conn.is_handshaking() {
        conn.complete_io(&mut tcp)?;
    }
    Ok(BufReader::new(Conn::Tls(Box::new(StreamOwned::new(conn, tcp)))))
}
