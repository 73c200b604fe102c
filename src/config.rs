use anyhow::bail;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration, constructed once at startup and shared read-only
/// between the listener and all transfer sessions.
pub struct TftpdConfig {
    /// address and port of the listening socket (the well-known TFTP port
    /// is 69)
    pub bind_addr: SocketAddr,

    /// directory that client-supplied filenames are resolved against; no
    /// transfer ever touches a path outside of it
    pub root_dir: PathBuf,

    /// Write requests are refused unless this is set. Read-only operation is
    /// the default because TFTP has no authentication whatsoever.
    pub writes_enabled: bool,

    /// number of times a session re-arms an expired receive (re-sending its
    /// unacknowledged DATA block on the read path) before giving up on the
    /// peer
    pub max_retries: u32,

    /// per-attempt bound on waiting for the peer's next datagram
    pub receive_timeout: Duration,

    /// DATA payload size. This server does not negotiate block sizes
    /// (RFC 2348), so this is 512 for interoperability with plain RFC 1350
    /// clients.
    pub block_size: usize,
}

impl TftpdConfig {
    pub fn new(bind_addr: SocketAddr, root_dir: PathBuf) -> TftpdConfig {
        TftpdConfig {
            bind_addr,
            root_dir,
            writes_enabled: false,
            max_retries: 3,
            receive_timeout: Duration::from_secs(5),
            block_size: 512,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.block_size == 0 {
            bail!("block size must not be zero");
        }
        if self.block_size > 1468 {
            bail!("block size {} does not fit an unfragmented UDP datagram", self.block_size);
        }
        if self.receive_timeout.is_zero() {
            bail!("receive timeout must not be zero");
        }
        Ok(())
    }
}
