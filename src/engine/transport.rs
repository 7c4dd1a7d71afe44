//! Device-side update server.
//!
//! Accepts one peer at a time, authenticates it with a challenge/response
//! and then feeds every received chunk to the Session Coordinator, replying
//! with a FirmwareAck per chunk and an OtaAck per finished update.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::engine::auth::{Authenticator, MAC_LEN};
use crate::engine::config::TransportConfig;
use crate::engine::error::TransportError;
use crate::engine::protocol::{FirmwareAck, IngestResult, OtaAck, HEADER_LEN};
use crate::engine::session::SessionCoordinator;
use crate::engine::storage::FirmwareStorage;

/// What happened on one connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionReport {
    pub chunks: u64,
    pub bytes: u64,
    /// Terminal acknowledgements sent, in order
    pub acks: Vec<OtaAck>,
}

/// Resets the session however the connection ends, including cancellation.
/// Chunks of this connection still queued on the blocking pool are dropped.
struct CleanGuard<'a, S: FirmwareStorage> {
    session: &'a SessionCoordinator<S>,
    open: Arc<AtomicBool>,
}

impl<S: FirmwareStorage> Drop for CleanGuard<'_, S> {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        self.session.clean();
    }
}

pub struct DeviceServer<S> {
    session: Arc<SessionCoordinator<S>>,
    auth: Arc<Authenticator>,
    rx_timeout: Duration,
    rx_buffer_len: usize,
}

impl<S: FirmwareStorage + 'static> DeviceServer<S> {
    pub fn new(
        transport: &TransportConfig,
        session: Arc<SessionCoordinator<S>>,
        auth: Arc<Authenticator>,
    ) -> Self {
        Self {
            session,
            auth,
            rx_timeout: transport.rx_timeout(),
            rx_buffer_len: transport.rx_buffer_len.max(HEADER_LEN),
        }
    }

    pub fn session(&self) -> &Arc<SessionCoordinator<S>> {
        &self.session
    }

    /// Bind and serve until the listener fails
    pub async fn serve(&self, addr: &str) -> Result<(), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Update server listening");
        self.serve_listener(listener).await
    }

    /// Serve connections sequentially; the next peer waits for the current one
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), TransportError> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Unable to accept the connection: {}", e);
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not disable Nagle: {}", e);
            }
            self.serve_peer(stream, peer).await;
        }
    }

    async fn serve_peer<T>(&self, stream: T, peer: SocketAddr)
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let span = info_span!("connection", id = %Uuid::new_v4(), %peer);
        async {
            info!("Client connected");
            match self.handle_connection(stream).await {
                Ok(report) => info!(
                    chunks = report.chunks,
                    bytes = report.bytes,
                    updates = report.acks.len(),
                    "Client disconnected"
                ),
                Err(TransportError::AuthFailed) => warn!("Client failed authentication"),
                Err(e) => warn!(code = %e.code(), "Connection closed: {}", e),
            }
        }
        .instrument(span)
        .await
    }

    /// Run one connection to completion. The update session is cleaned on
    /// every exit path.
    pub async fn handle_connection<T>(&self, mut stream: T) -> Result<ConnectionReport, TransportError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let open = Arc::new(AtomicBool::new(true));
        let _clean = CleanGuard {
            session: self.session.as_ref(),
            open: Arc::clone(&open),
        };

        self.authenticate(&mut stream).await?;

        let mut report = ConnectionReport::default();
        let mut buffer = vec![0u8; self.rx_buffer_len];
        loop {
            let received = match timeout(self.rx_timeout, stream.read(&mut buffer)).await {
                Err(_) => {
                    warn!(timeout = ?self.rx_timeout, "Receive timed out");
                    return Err(TransportError::Timeout(self.rx_timeout));
                }
                Ok(Err(e)) => {
                    error!("Receiving error: {}", e);
                    return Err(e.into());
                }
                Ok(Ok(0)) => return Ok(report),
                Ok(Ok(n)) => n,
            };

            report.chunks += 1;
            report.bytes += received as u64;

            let result = self.ingest(&open, &buffer[..received]).await?;

            stream.write_all(&FirmwareAck.to_bytes()).await?;
            if let Some(ack) = result.ota_ack() {
                info!(
                    bytes_written = ack.bytes_written,
                    status = ack.status.code(),
                    "Update finished"
                );
                stream.write_all(&ack.to_bytes()).await?;
                report.acks.push(ack);
            }
            stream.flush().await?;
        }
    }

    async fn authenticate<T>(&self, stream: &mut T) -> Result<(), TransportError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let nonce = self.auth.issue_nonce();
        stream.write_all(&nonce).await?;
        stream.flush().await?;

        let mut response = [0u8; MAC_LEN];
        timeout(self.rx_timeout, stream.read_exact(&mut response))
            .await
            .map_err(|_| TransportError::Timeout(self.rx_timeout))??;

        if !self.auth.verify_response(&nonce, &response) {
            return Err(TransportError::AuthFailed);
        }
        Ok(())
    }

    /// Storage writes block, so ingest runs on the blocking pool
    async fn ingest(&self, open: &Arc<AtomicBool>, chunk: &[u8]) -> Result<IngestResult, TransportError> {
        let session = Arc::clone(&self.session);
        let open = Arc::clone(open);
        let chunk = chunk.to_vec();
        tokio::task::spawn_blocking(move || session.ingest_while_open(&open, &chunk))
            .await
            .map_err(|e| TransportError::Worker(e.to_string()))?
            .ok_or(TransportError::Closed)
    }
}
