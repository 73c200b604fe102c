use anyhow::Context;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace, warn};

use crate::config::TftpdConfig;
use crate::file_store::{FileStore, LocalFileStore};
use crate::packet::{ErrorCode, ErrorPacket, Request, RequestKind};
use crate::session::{TransferSession, UdpSessionSocket};

/// Requests are a 2-byte opcode plus two zero-terminated strings; anything
/// longer than this is not a request this server understands.
const MAX_REQUEST_LEN: usize = 1024;

/// Owns the well-known port. The listening socket receives *only* the opening
/// packet of each transfer and hands every accepted request to a freshly
/// spawned [`TransferSession`] with its own ephemeral-port socket; it never
/// takes part in an ongoing transfer and never waits for a session to finish.
pub struct TftpServer {
    config: Arc<TftpdConfig>,
    listen_socket: UdpSocket,
    root_dir: PathBuf,
    file_store: Arc<dyn FileStore>,
}

impl TftpServer {
    pub async fn new(config: Arc<TftpdConfig>) -> anyhow::Result<TftpServer> {
        config.validate()?;

        let listen_socket = UdpSocket::bind(config.bind_addr)
            .await
            .with_context(|| format!("binding listening socket to {:?}", config.bind_addr))?;
        info!("bound listening socket to {:?}", listen_socket.local_addr()?);

        let root_dir = tokio::fs::canonicalize(&config.root_dir)
            .await
            .with_context(|| format!("resolving root directory {:?}", config.root_dir))?;
        info!("serving files below {:?}", root_dir);

        Ok(TftpServer {
            config,
            listen_socket,
            root_dir,
            file_store: Arc::new(LocalFileStore),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listen_socket.local_addr()?)
    }

    /// Receives request datagrams indefinitely. All retry and timeout
    /// handling lives inside the sessions; the listener itself never blocks
    /// on anything but the next request.
    pub async fn listen(&self) {
        info!("starting listen loop");

        let mut buf = vec![0u8; MAX_REQUEST_LEN];
        loop {
            let (num_read, from) = match self.listen_socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };
            trace!("received request datagram from {:?}: {:?}", from, &buf[..num_read]);

            self.dispatch_request(&buf[..num_read], from).await;
        }
    }

    async fn dispatch_request(&self, datagram: &[u8], from: SocketAddr) {
        let request = match Request::deser(&mut &datagram[..]) {
            Ok(request) => request,
            Err(e) => {
                warn!("received datagram with no decodable request from {:?}: {}", from, e);
                self.send_listener_error(from, ErrorPacket::new(ErrorCode::IllegalOperation, "Opcode not understood"))
                    .await;
                return;
            }
        };

        if request.kind == RequestKind::Write && !self.config.writes_enabled {
            info!("rejecting write request for {:?} from {:?}", request.filename, from);
            self.send_listener_error(
                from,
                ErrorPacket::new(ErrorCode::IllegalOperation, "Write request is not enabled"),
            )
            .await;
            return;
        }

        let config = self.config.clone();
        let root_dir = self.root_dir.clone();
        let file_store = self.file_store.clone();
        tokio::spawn(async move {
            let socket = match UdpSessionSocket::bind(from, config.as_ref()).await {
                Ok(socket) => socket,
                Err(e) => {
                    error!("could not bind transfer socket for {:?}: {}", from, e);
                    return;
                }
            };

            TransferSession::new(config, root_dir, from, Box::new(socket), file_store)
                .run(request)
                .await;
        });
    }

    /// Best effort: the sender has no session yet, so replying from the
    /// listening socket cannot collide with any transfer.
    async fn send_listener_error(&self, to: SocketAddr, error: ErrorPacket) {
        let mut buf = BytesMut::new();
        error.ser(&mut buf);

        if let Err(e) = self.listen_socket.send_to(&buf, to).await {
            debug!("could not send error packet to {:?}: {}", to, e);
        }
    }
}
