//! Event-driven LMTP listener
//!
//! One tokio task per connection. Input is framed by [`LmtpCodec`] and fed
//! to a [`Session`]; the actions it returns are carried out here.

use crate::delivery::DeliveryCoordinator;
use crate::lmtp::codec::{CodecError, Frame, LmtpCodec};
use crate::lmtp::framer::FramerError;
use crate::lmtp::protocol::{Action, Response, Session, SessionConfig};
use crate::lmtp::reply::{Reply, ReplyContext};
use crate::lmtp::tls;
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use rustls::ServerConfig;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::{Instant, Sleep};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Plain or TLS connection
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type Transport = Framed<Box<dyn AsyncStream>, LmtpCodec>;

/// Fails a read with `TimedOut` once no bytes have arrived for the idle
/// limit. The clock starts when a read begins to wait, as with a socket
/// read timeout, so time spent between reads is not counted.
struct IdleStream<S> {
    inner: S,
    idle: Option<Duration>,
    deadline: Pin<Box<Sleep>>,
    waiting: bool,
}

impl<S> IdleStream<S> {
    fn new(inner: S, idle: Option<Duration>) -> Self {
        Self {
            inner,
            idle,
            deadline: Box::pin(tokio::time::sleep(Duration::ZERO)),
            waiting: false,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(result) = Pin::new(&mut this.inner).poll_read(cx, buf) {
            this.waiting = false;
            return Poll::Ready(result);
        }
        let Some(idle) = this.idle else {
            return Poll::Pending;
        };
        if !this.waiting {
            this.waiting = true;
            this.deadline.as_mut().reset(Instant::now() + idle);
        }
        match this.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => {
                this.waiting = false;
                Poll::Ready(Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// LMTP server on the tokio runtime
pub struct LmtpServer {
    coordinator: Arc<DeliveryCoordinator>,
    tls_acceptor: Option<TlsAcceptor>,
    connection_semaphore: Arc<Semaphore>,
}

impl LmtpServer {
    pub fn new(coordinator: Arc<DeliveryCoordinator>, tls: Option<Arc<ServerConfig>>) -> Self {
        let max_connections = coordinator.config().get().lmtp.max_connections;
        Self {
            coordinator,
            tls_acceptor: tls.map(tls::acceptor),
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Bind the configured address and serve forever
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let config = self.coordinator.config().get();
        let addr = format!("{}:{}", config.lmtp.host, config.lmtp.port);
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let tls_status = if self.tls_acceptor.is_some() {
            "STARTTLS enabled"
        } else {
            "STARTTLS disabled"
        };
        info!(addr = %listener.local_addr()?, "LMTP server listening ({})", tls_status);

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let metrics = self.coordinator.metrics();
                    let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(peer = %peer, "Max connections reached, rejecting");
                            metrics.rejected_connections.inc();
                            continue;
                        }
                    };
                    metrics.connections.with_label_values(&["async"]).inc();

                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        let metrics = server.coordinator.metrics().clone();
                        metrics.active_connections.inc();
                        if let Err(e) = server.handle_connection(stream, peer).await {
                            warn!(peer = %peer, error = %e, "LMTP session error");
                        }
                        metrics.active_connections.dec();
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept LMTP connection");
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        debug!(peer = %peer, "New LMTP connection");
        let config = self.coordinator.config().get();
        let max_line_length = config.lmtp.max_line_length;
        let idle = Some(Duration::from_secs(config.lmtp.idle_timeout_secs))
            .filter(|d| !d.is_zero());
        let mut session = Session::new(SessionConfig::from_config(
            &config,
            self.tls_acceptor.is_some(),
        ));
        let ctx = session.reply_context();

        // TLS sits on top of the idle clock, so ciphertext keeps it alive
        let io: Box<dyn AsyncStream> = Box::new(IdleStream::new(stream, idle));
        let mut framed: Transport = Framed::new(io, LmtpCodec::new(max_line_length));
        write(&mut framed, &session.greeting(), &ctx).await?;

        loop {
            let frame = match framed.next().await {
                None => {
                    debug!(peer = %peer, "Connection closed by client");
                    break;
                }
                Some(Err(CodecError::Io(e))) if e.kind() == io::ErrorKind::TimedOut => {
                    info!(peer = %peer, "Idle timeout, closing connection");
                    write(&mut framed, &session.idle_timeout(), &ctx).await?;
                    break;
                }
                Some(Err(CodecError::Framer(FramerError::PrematureEof))) => {
                    info!(peer = %peer, "Connection closed during DATA");
                    session.data_aborted();
                    break;
                }
                Some(Err(CodecError::LineTooLong(limit))) => {
                    warn!(peer = %peer, limit, "Command line too long, closing connection");
                    write(&mut framed, &Response::Single(Reply::SYNTAX_ERROR), &ctx).await?;
                    break;
                }
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(frame)) => frame,
            };

            let (response, action) = match frame {
                Frame::Line(line) => {
                    debug!(peer = %peer, command = %line, "LMTP command");
                    session.command(&line)
                }
                Frame::Message(message) => session.data_received(message),
            };

            match action {
                Action::None => write(&mut framed, &response, &ctx).await?,
                Action::CheckRecipient(mut address) => {
                    let status = self.coordinator.status(&mut address).await;
                    let response = session.recipient_checked(address, status);
                    write(&mut framed, &response, &ctx).await?;
                }
                Action::ReceiveData => {
                    write(&mut framed, &response, &ctx).await?;
                    framed.codec_mut().start_data(session.max_message_size());
                }
                Action::Deliver(mut envelope, body) => {
                    match self.coordinator.deliver(&mut envelope, body).await {
                        Ok(replies) => {
                            let response = session.delivered(replies);
                            write(&mut framed, &response, &ctx).await?;
                        }
                        Err(e) => {
                            error!(peer = %peer, error = %e, "Dropping connection");
                            session.data_aborted();
                            break;
                        }
                    }
                }
                Action::StartTls => {
                    let Some(acceptor) = self.tls_acceptor.as_ref() else {
                        write(&mut framed, &Response::Single(Reply::STARTTLS_NOT_AVAILABLE), &ctx)
                            .await?;
                        continue;
                    };
                    write(&mut framed, &response, &ctx).await?;
                    framed = upgrade(framed, acceptor, max_line_length).await?;
                    session.tls_established();
                    debug!(peer = %peer, "TLS established");
                }
                Action::Close => {
                    write(&mut framed, &response, &ctx).await?;
                    break;
                }
            }
        }

        debug!(peer = %peer, "LMTP connection closed");
        Ok(())
    }
}

async fn write(framed: &mut Transport, response: &Response, ctx: &ReplyContext) -> Result<()> {
    let text = response.render(ctx);
    if !text.is_empty() {
        framed.send(text).await?;
    }
    Ok(())
}

/// Run the TLS handshake. Plaintext pipelined after STARTTLS is discarded.
async fn upgrade(framed: Transport, acceptor: &TlsAcceptor, max_line_length: usize) -> io::Result<Transport> {
    let parts = framed.into_parts();
    if !parts.read_buf.is_empty() {
        warn!(bytes = parts.read_buf.len(), "Discarding plaintext sent after STARTTLS");
    }
    let stream = acceptor.accept(parts.io).await?;
    let io: Box<dyn AsyncStream> = Box::new(stream);
    Ok(Framed::new(io, LmtpCodec::new(max_line_length)))
}
