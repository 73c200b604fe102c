use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, error, info, trace};

use crate::config::TftpdConfig;
use crate::file_store::FileStore;
use crate::packet::{AckPacket, DataPacket, ErrorCode, ErrorPacket, Request, RequestKind, SessionPacket, MODE_OCTET};
use crate::path_resolver;
use crate::path_resolver::PathRejection;

/// Abstraction over a session's private UDP socket, introduced to facilitate
/// mocking the I/O part away for testing. The per-attempt receive timeout
/// lives behind this trait, so the protocol logic above only ever sees
/// "a datagram arrived" or "the attempt timed out".
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionSocket: Send + Sync + 'static {
    async fn send_packet(&self, packet_buf: &[u8]);

    /// waits for the next datagram from the peer; `None` means the
    /// per-attempt timeout elapsed
    async fn recv_packet(&self) -> Option<Vec<u8>>;
}

/// `SessionSocket` over a freshly bound ephemeral-port UDP socket. The
/// ephemeral port is this transfer's id; datagrams from any other address
/// than the session's peer are dropped without affecting the transfer.
pub struct UdpSessionSocket {
    socket: UdpSocket,
    peer_addr: SocketAddr,
    receive_timeout: Duration,
    max_datagram_len: usize,
}

impl UdpSessionSocket {
    pub async fn bind(peer_addr: SocketAddr, config: &TftpdConfig) -> anyhow::Result<UdpSessionSocket> {
        let bind_addr: SocketAddr = if peer_addr.is_ipv4() {
            "0.0.0.0:0".parse()?
        }
        else {
            "[::]:0".parse()?
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        debug!("bound transfer socket {:?} for peer {:?}", socket.local_addr()?, peer_addr);

        Ok(UdpSessionSocket {
            socket,
            peer_addr,
            receive_timeout: config.receive_timeout,
            // headroom past the header so oversized DATA packets arrive
            //  intact and can be recognized as invalid
            max_datagram_len: config.block_size + 8,
        })
    }
}

#[async_trait]
impl SessionSocket for UdpSessionSocket {
    async fn send_packet(&self, packet_buf: &[u8]) {
        trace!("sending packet to {:?}: {:?}", self.peer_addr, packet_buf);

        if let Err(e) = self.socket.send_to(packet_buf, self.peer_addr).await {
            error!("error sending UDP packet to {:?}: {}", self.peer_addr, e);
        }
    }

    async fn recv_packet(&self) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; self.max_datagram_len];

        let bounded = timeout(self.receive_timeout, async {
            loop {
                match self.socket.recv_from(&mut buf).await {
                    Ok((num_read, from)) if from == self.peer_addr => {
                        return buf[..num_read].to_vec();
                    }
                    Ok((_, from)) => {
                        debug!("dropping datagram from {:?}, transfer peer is {:?}", from, self.peer_addr);
                    }
                    Err(e) => {
                        error!("socket error: {}", e);
                    }
                }
            }
        });

        match bounded.await {
            Ok(datagram) => {
                trace!("received packet from {:?}: {:?}", self.peer_addr, datagram);
                Some(datagram)
            }
            Err(_) => None,
        }
    }
}

/// The closed set of ways one transfer can fail. Each session-local failure
/// is mapped to its wire representation in exactly one place
/// ([`TransferFailure::wire_error`]); none of them ever affects the listener
/// or other sessions.
#[derive(Debug, Error)]
pub enum TransferFailure {
    #[error("requested path rejected: {0:?}")]
    PathRejected(PathRejection),

    #[error("file not found")]
    FileNotFound,

    #[error("file access denied")]
    FileAccess,

    #[error("transfer mode {0:?} not supported")]
    UnsupportedMode(String),

    #[error("peer reported error {code}: {message}")]
    PeerError { code: u16, message: String },

    #[error("retry budget exhausted")]
    RetryExhausted,
}

impl TransferFailure {
    /// The error packet to close the session with, if any. A peer that
    /// reported an error or stopped answering gets nothing back.
    fn wire_error(&self) -> Option<ErrorPacket> {
        match self {
            TransferFailure::PathRejected(PathRejection::Unresolvable) | TransferFailure::FileNotFound => {
                Some(ErrorPacket::new(ErrorCode::FileNotFound, "File not found"))
            }
            TransferFailure::PathRejected(PathRejection::OutsideRoot) | TransferFailure::FileAccess => {
                Some(ErrorPacket::new(ErrorCode::AccessViolation, "Access violation"))
            }
            TransferFailure::UnsupportedMode(mode) => {
                Some(ErrorPacket::new(ErrorCode::UnknownTransferId, format!("Mode {} not supported", mode)))
            }
            TransferFailure::PeerError { .. } | TransferFailure::RetryExhausted => None,
        }
    }
}

/// the 16-bit block number that goes on the wire for the session's running
/// block counter; 65535 is followed by 0, not 1
fn wire_block(block: u64) -> u16 {
    (block % (u16::MAX as u64 + 1)) as u16
}

/// One client's transfer: owns its socket and file handle exclusively and
/// runs to completion or failure without reporting back to the listener.
pub struct TransferSession {
    config: Arc<TftpdConfig>,
    root_dir: PathBuf,
    peer_addr: SocketAddr,
    socket: Box<dyn SessionSocket>,
    file_store: Arc<dyn FileStore>,
}

impl TransferSession {
    pub fn new(
        config: Arc<TftpdConfig>,
        root_dir: PathBuf,
        peer_addr: SocketAddr,
        socket: Box<dyn SessionSocket>,
        file_store: Arc<dyn FileStore>,
    ) -> TransferSession {
        TransferSession {
            config,
            root_dir,
            peer_addr,
            socket,
            file_store,
        }
    }

    /// Runs the transfer to completion. Consumes the session: socket and file
    /// handle are released on every exit path.
    pub async fn run(self, request: Request) {
        info!("starting {:?} transfer of {:?} for {:?}", request.kind, request.filename, self.peer_addr);

        let result = match request.kind {
            RequestKind::Read => self.run_read(&request).await,
            RequestKind::Write => self.run_write(&request).await,
        };

        match result {
            Ok(()) => {
                info!("completed {:?} transfer of {:?} for {:?}", request.kind, request.filename, self.peer_addr);
            }
            Err(failure) => {
                if let Some(error_packet) = failure.wire_error() {
                    let mut buf = BytesMut::new();
                    error_packet.ser(&mut buf);
                    self.socket.send_packet(&buf).await;
                }
                info!(
                    "aborted {:?} transfer of {:?} for {:?}: {}",
                    request.kind, request.filename, self.peer_addr, failure
                );
            }
        }
    }

    fn resolve_request(&self, request: &Request) -> Result<PathBuf, TransferFailure> {
        if !request.mode.eq_ignore_ascii_case(MODE_OCTET) {
            return Err(TransferFailure::UnsupportedMode(request.mode.clone()));
        }
        path_resolver::resolve(&self.root_dir, &request.filename).map_err(TransferFailure::PathRejected)
    }

    /// Server-to-client transfer: send a block, wait for its acknowledgment,
    /// advance. The short block is the end-of-file marker, so a file whose
    /// length is an exact multiple of the block size gets one trailing
    /// zero-length block, and an empty file is sent as a single zero-length
    /// block 1.
    async fn run_read(&self, request: &Request) -> Result<(), TransferFailure> {
        let path = self.resolve_request(request)?;
        let mut source = self
            .file_store
            .open_source(&path)
            .await
            .map_err(open_failure)?;

        let block_size = self.config.block_size;
        let mut block: u64 = 1;
        loop {
            let offset = (block - 1) * block_size as u64;
            let payload = source
                .read_block(offset, block_size)
                .await
                .map_err(|_| TransferFailure::FileAccess)?;
            let last_block = payload.len() < block_size;

            let data = DataPacket { block: wire_block(block), payload };
            let mut packet_buf = BytesMut::with_capacity(4 + data.payload.len());
            data.ser(&mut packet_buf);

            self.send_and_await_ack(&packet_buf, data.block).await?;

            if last_block {
                return Ok(());
            }
            block += 1;
        }
    }

    /// Sends one DATA packet and waits for the matching acknowledgment.
    /// Non-matching acknowledgments (stale duplicates as well as numbers
    /// ahead of the window) and malformed datagrams are inert: the wait is
    /// re-armed without a retransmit and without touching the retry budget.
    /// Only an expired timeout consumes a retry and re-sends the identical
    /// packet.
    async fn send_and_await_ack(&self, packet_buf: &[u8], expected_block: u16) -> Result<(), TransferFailure> {
        let mut retries_remaining = self.config.max_retries;

        self.socket.send_packet(packet_buf).await;
        loop {
            match self.socket.recv_packet().await {
                Some(datagram) => match SessionPacket::deser(&mut datagram.as_slice()) {
                    Ok(SessionPacket::Ack(ack)) if ack.block == expected_block => {
                        trace!("block {} acknowledged", expected_block);
                        return Ok(());
                    }
                    Ok(SessionPacket::Ack(ack)) => {
                        debug!("ignoring ACK for block {} while waiting for block {}", ack.block, expected_block);
                    }
                    Ok(SessionPacket::Error(e)) => {
                        return Err(TransferFailure::PeerError { code: e.code, message: e.message });
                    }
                    Ok(SessionPacket::Data(_)) | Err(_) => {
                        debug!("ignoring unexpected datagram while waiting for ACK of block {}", expected_block);
                    }
                },
                None => {
                    if retries_remaining == 0 {
                        return Err(TransferFailure::RetryExhausted);
                    }
                    retries_remaining -= 1;
                    debug!(
                        "timeout waiting for ACK of block {}, re-sending ({} retries left)",
                        expected_block, retries_remaining
                    );
                    self.socket.send_packet(packet_buf).await;
                }
            }
        }
    }

    /// Client-to-server transfer: acknowledge block 0 to accept the request,
    /// then write each arriving block in sequence. A block with the wrong
    /// number is answered by re-acknowledging the last written block and is
    /// never written, so a duplicated DATA packet cannot duplicate data in
    /// the file. Timeouts consume the retry budget without re-sending
    /// anything; the peer's own retransmit drives recovery.
    async fn run_write(&self, request: &Request) -> Result<(), TransferFailure> {
        let path = self.resolve_request(request)?;
        let mut sink = self
            .file_store
            .open_sink(&path)
            .await
            .map_err(open_failure)?;

        let block_size = self.config.block_size;
        self.send_ack(0).await;

        let mut expected: u64 = 1;
        let mut retries_remaining = self.config.max_retries;
        loop {
            let expected_block = wire_block(expected);
            match self.socket.recv_packet().await {
                Some(datagram) => match SessionPacket::deser(&mut datagram.as_slice()) {
                    Ok(SessionPacket::Data(data))
                        if data.block == expected_block && data.payload.len() <= block_size =>
                    {
                        sink.write_block(&data.payload)
                            .await
                            .map_err(|_| TransferFailure::FileAccess)?;
                        self.send_ack(expected_block).await;
                        retries_remaining = self.config.max_retries;

                        if data.payload.len() < block_size {
                            return Ok(());
                        }
                        expected += 1;
                    }
                    Ok(SessionPacket::Error(e)) => {
                        return Err(TransferFailure::PeerError { code: e.code, message: e.message });
                    }
                    Ok(_) | Err(_) => {
                        // wrong block number, oversized payload or malformed:
                        //  re-acknowledge the last written block, write nothing
                        let last_written = wire_block(expected - 1);
                        debug!(
                            "unexpected datagram while waiting for DATA block {}, re-acknowledging block {}",
                            expected_block, last_written
                        );
                        self.send_ack(last_written).await;
                    }
                },
                None => {
                    if retries_remaining == 0 {
                        return Err(TransferFailure::RetryExhausted);
                    }
                    retries_remaining -= 1;
                    debug!(
                        "timeout waiting for DATA block {} ({} retries left)",
                        expected_block, retries_remaining
                    );
                }
            }
        }
    }

    async fn send_ack(&self, block: u16) {
        let mut buf = BytesMut::with_capacity(4);
        AckPacket { block }.ser(&mut buf);
        self.socket.send_packet(&buf).await;
    }
}

fn open_failure(e: io::Error) -> TransferFailure {
    match e.kind() {
        io::ErrorKind::NotFound => TransferFailure::FileNotFound,
        _ => TransferFailure::FileAccess,
    }
}
