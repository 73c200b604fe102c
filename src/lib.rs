//! A TFTP server (RFC 1350).
//!
//! TFTP transfers files in fixed-size blocks over UDP, one outstanding block
//! at a time: the sender of data transmits a block and waits for its
//! acknowledgment before transmitting the next one. Lost packets are recovered
//! by retransmission on timeout, bounded by a per-session retry budget.
//!
//! ## Design
//!
//! * One long-lived listening socket owns the well-known port. It receives
//!   *only* the opening packet of each transfer (a read or write request) and
//!   is never used for an ongoing transfer's data exchange.
//! * Every accepted request spawns an independent session task with its own
//!   UDP socket bound to an ephemeral port. The ephemeral port pair is the
//!   "transfer id" that keeps concurrent transfers apart.
//! * Sessions share nothing mutable with the listener or each other; each owns
//!   its socket and file handle exclusively and releases both on every exit
//!   path.
//! * Client-supplied filenames are taken as relative to a configured root
//!   directory and are rejected if they resolve outside of it.
//! * Only the binary (`octet`) transfer mode is supported; write requests are
//!   rejected unless explicitly enabled in the configuration.
//!
//! ## Wire format
//!
//! All UDP payloads start with a 16-bit big-endian opcode:
//!
//! ```ascii
//! RRQ   = 1:  | u16 opcode | filename | 0 | mode | 0 |
//! WRQ   = 2:  | u16 opcode | filename | 0 | mode | 0 |
//! DATA  = 3:  | u16 opcode | u16 block | payload (<= block size bytes) |
//! ACK   = 4:  | u16 opcode | u16 block |
//! ERROR = 5:  | u16 opcode | u16 error code | message | 0 |
//! ```
//!
//! `filename`, `mode` and `message` are zero-terminated ASCII strings.
//!
//! Block numbers form a 16-bit sequence space starting at 1 (block 0 is
//! reserved for the acknowledgment that opens a write transfer) and wrap
//! around to 0 after 65535. A DATA payload shorter than the block size marks
//! the end of a transfer; a file whose length is an exact multiple of the
//! block size is terminated by a zero-length DATA block.
//!
//! Error codes used by this server:
//!
//! ```ascii
//! 0  not defined
//! 1  file not found
//! 2  access violation
//! 4  illegal operation
//! 5  unknown transfer id (also sent for unsupported transfer modes)
//! ```

pub mod config;
pub mod file_store;
pub mod packet;
pub mod path_resolver;
pub mod server;
pub mod session;
