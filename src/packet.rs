use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// the only transfer mode this server accepts
pub const MODE_OCTET: &str = "octet";

/// Error messages are clamped to this length on the wire. TFTP has no upper
/// bound of its own, but the message must fit the peer's receive buffer
/// alongside the 4-byte header.
const MAX_ERROR_MESSAGE_LEN: usize = 128;

#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

/// The RFC 1350 error codes this server emits. Peers may send codes outside
/// this set, so decoded error packets keep the raw number.
#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum ErrorCode {
    Undefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    IllegalOperation = 4,
    UnknownTransferId = 5,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RequestKind {
    Read,
    Write,
}

/// The opening packet of a transfer, naming the file and the transfer mode.
///
/// The mode is kept as the raw string from the wire: rejecting unsupported
/// modes with the right wire error is session logic, not codec logic.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Request {
    pub kind: RequestKind,
    pub filename: String,
    pub mode: String,
}

impl Request {
    pub fn ser(&self, buf: &mut BytesMut) {
        let opcode = match self.kind {
            RequestKind::Read => Opcode::Rrq,
            RequestKind::Write => Opcode::Wrq,
        };
        buf.put_u16(opcode.into());
        buf.put_slice(self.filename.as_bytes());
        buf.put_u8(0);
        buf.put_slice(self.mode.as_bytes());
        buf.put_u8(0);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Request> {
        let opcode = buf.try_get_u16()?;
        let kind = match Opcode::try_from(opcode) {
            Ok(Opcode::Rrq) => RequestKind::Read,
            Ok(Opcode::Wrq) => RequestKind::Write,
            _ => bail!("not a transfer request: opcode {}", opcode),
        };

        let mut rest = buf.copy_to_bytes(buf.remaining());
        let filename = take_cstring(&mut rest)?;
        let mode = take_cstring(&mut rest)?;
        // anything after the mode terminator (e.g. RFC 2347 option lists) is
        //  ignored rather than rejected
        Ok(Request { kind, filename, mode })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataPacket {
    pub block: u16,
    pub payload: Vec<u8>,
}

impl DataPacket {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(Opcode::Data.into());
        buf.put_u16(self.block);
        buf.put_slice(&self.payload);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AckPacket {
    pub block: u16,
}

impl AckPacket {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(Opcode::Ack.into());
        buf.put_u16(self.block);
    }
}

/// Terminal in both directions: after sending or receiving one of these, a
/// session stops without further packets.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ErrorPacket {
    pub code: u16,
    pub message: String,
}

impl ErrorPacket {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> ErrorPacket {
        ErrorPacket {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(Opcode::Error.into());
        buf.put_u16(self.code);
        for &b in self.message.as_bytes().iter().take(MAX_ERROR_MESSAGE_LEN) {
            // the message field is ASCII on the wire
            buf.put_u8(if (b' '..=b'~').contains(&b) { b } else { b'?' });
        }
        buf.put_u8(0);
    }
}

/// The packets exchanged on a session's ephemeral socket once a transfer is
/// under way.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SessionPacket {
    Data(DataPacket),
    Ack(AckPacket),
    Error(ErrorPacket),
}

impl SessionPacket {
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SessionPacket> {
        let opcode = buf.try_get_u16()?;
        match Opcode::try_from(opcode) {
            Ok(Opcode::Data) => {
                let block = buf.try_get_u16()?;
                let payload = buf.copy_to_bytes(buf.remaining()).to_vec();
                Ok(SessionPacket::Data(DataPacket { block, payload }))
            }
            Ok(Opcode::Ack) => {
                let block = buf.try_get_u16()?;
                Ok(SessionPacket::Ack(AckPacket { block }))
            }
            Ok(Opcode::Error) => {
                let code = buf.try_get_u16()?;
                let raw = buf.copy_to_bytes(buf.remaining());
                let terminator = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                let message = String::from_utf8_lossy(&raw[..terminator]).into_owned();
                Ok(SessionPacket::Error(ErrorPacket { code, message }))
            }
            _ => bail!("not a session packet: opcode {}", opcode),
        }
    }
}

fn take_cstring(buf: &mut Bytes) -> anyhow::Result<String> {
    let Some(terminator) = buf.iter().position(|&b| b == 0) else {
        bail!("string field without zero terminator");
    };
    let field = buf.split_to(terminator);
    buf.advance(1);
    if !field.is_ascii() {
        bail!("string field with non-ASCII bytes");
    }
    Ok(String::from_utf8(field.to_vec())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::rrq(vec![0,1, b'h',b'i',0, b'o',b'c',b't',b'e',b't',0], RequestKind::Read, "hi", "octet")]
    #[case::wrq(vec![0,2, b'f',0, b'o',b'c',b't',b'e',b't',0], RequestKind::Write, "f", "octet")]
    #[case::netascii(vec![0,1, b'f',0, b'n',b'e',b't',b'a',b's',b'c',b'i',b'i',0], RequestKind::Read, "f", "netascii")]
    #[case::trailing_options(vec![0,1, b'f',0, b'o',b'c',b't',b'e',b't',0, b'b',b'l',b'k',0, b'8',0], RequestKind::Read, "f", "octet")]
    fn test_request_deser(
        #[case] raw: Vec<u8>,
        #[case] expected_kind: RequestKind,
        #[case] expected_filename: &str,
        #[case] expected_mode: &str,
    ) {
        let request = Request::deser(&mut raw.as_slice()).unwrap();
        assert_eq!(request.kind, expected_kind);
        assert_eq!(request.filename, expected_filename);
        assert_eq!(request.mode, expected_mode);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::opcode_only(vec![0,1])]
    #[case::truncated_opcode(vec![0])]
    #[case::data_opcode(vec![0,3, b'f',0, b'o',b'c',b't',b'e',b't',0])]
    #[case::unknown_opcode(vec![0,9, b'f',0, b'o',b'c',b't',b'e',b't',0])]
    #[case::unterminated_filename(vec![0,1, b'f',b'i',b'l',b'e'])]
    #[case::unterminated_mode(vec![0,1, b'f',0, b'o',b'c',b't',b'e',b't'])]
    #[case::non_ascii_filename(vec![0,1, 0xc3,0xa9,0, b'o',b'c',b't',b'e',b't',0])]
    fn test_request_deser_rejects(#[case] raw: Vec<u8>) {
        assert!(Request::deser(&mut raw.as_slice()).is_err());
    }

    #[rstest]
    #[case::read("read.bin", RequestKind::Read)]
    #[case::write("dir/write.bin", RequestKind::Write)]
    fn test_request_roundtrip(#[case] filename: &str, #[case] kind: RequestKind) {
        let original = Request {
            kind,
            filename: filename.to_string(),
            mode: MODE_OCTET.to_string(),
        };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        let mut b: &[u8] = &buf;
        let deser = Request::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[rstest]
    #[case::empty_payload(0, vec![])]
    #[case::first_block(1, vec![1,2,3])]
    #[case::wrapped_block(u16::MAX, vec![0; 512])]
    fn test_data_roundtrip(#[case] block: u16, #[case] payload: Vec<u8>) {
        let original = DataPacket { block, payload };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(&buf[..2], &[0, 3]);

        let deser = SessionPacket::deser(&mut &buf[..]).unwrap();
        assert_eq!(deser, SessionPacket::Data(original));
    }

    #[rstest]
    #[case::initial(0)]
    #[case::first(1)]
    #[case::highest(u16::MAX)]
    fn test_ack_roundtrip(#[case] block: u16) {
        let original = AckPacket { block };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.as_ref(), &[0, 4, (block >> 8) as u8, block as u8]);

        let deser = SessionPacket::deser(&mut &buf[..]).unwrap();
        assert_eq!(deser, SessionPacket::Ack(original));
    }

    #[test]
    fn test_error_ser() {
        let mut buf = BytesMut::new();
        ErrorPacket::new(ErrorCode::FileNotFound, "File not found").ser(&mut buf);

        let mut expected = vec![0, 5, 0, 1];
        expected.extend_from_slice(b"File not found\0");
        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_error_ser_sanitizes_message() {
        let mut buf = BytesMut::new();
        ErrorPacket::new(ErrorCode::Undefined, "bad\nbyte\u{e9}").ser(&mut buf);

        let mut expected = vec![0, 5, 0, 0];
        expected.extend_from_slice(b"bad?byte??\0");
        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_error_ser_truncates_message() {
        let mut buf = BytesMut::new();
        ErrorPacket::new(ErrorCode::Undefined, "x".repeat(1000)).ser(&mut buf);

        assert_eq!(buf.len(), 4 + MAX_ERROR_MESSAGE_LEN + 1);
        assert_eq!(buf[buf.len() - 1], 0);
    }

    #[test]
    fn test_error_deser_without_terminator() {
        let raw = [0u8, 5, 0, 2, b'n', b'o', b'p', b'e'];
        let deser = SessionPacket::deser(&mut &raw[..]).unwrap();
        assert_eq!(
            deser,
            SessionPacket::Error(ErrorPacket { code: 2, message: "nope".to_string() })
        );
    }

    #[test]
    fn test_error_deser_keeps_unknown_code() {
        let raw = [0u8, 5, 0, 3, b'f', b'u', b'l', b'l', 0];
        let deser = SessionPacket::deser(&mut &raw[..]).unwrap();
        assert_eq!(
            deser,
            SessionPacket::Error(ErrorPacket { code: 3, message: "full".to_string() })
        );
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::opcode_only(vec![0,3])]
    #[case::truncated_block(vec![0,4,0])]
    #[case::request_opcode(vec![0,1,0,1])]
    #[case::unknown_opcode(vec![0,7,0,1])]
    fn test_session_packet_deser_rejects(#[case] raw: Vec<u8>) {
        assert!(SessionPacket::deser(&mut raw.as_slice()).is_err());
    }
}
