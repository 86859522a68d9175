//! The SPUD wire format: a fixed 13-byte header followed by an optional CBOR
//! payload.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        magic cookie                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! +                         tube id (64 bit)                     +
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |C C|A|P|R R R R|                 CBOR payload...               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

pub mod cbor;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Error, Result};
use crate::id::TubeId;

/// The four-byte magic cookie every SPUD packet begins with.
pub const MAGIC_COOKIE: [u8; 4] = [0xd8, 0x00, 0x00, 0xd8];

/// Size of the fixed SPUD header in bytes (magic + tube id + flags).
pub const HEADER_SIZE: usize = 13;

const COMMAND_MASK: u8 = 0xC0;
const ADEC_BIT: u8 = 0x20;
const PDEC_BIT: u8 = 0x10;

/// The command carried in the top two bits of the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Data,
    Open,
    Close,
    Ack,
}

impl Command {
    fn from_bits(bits: u8) -> Self {
        match bits & COMMAND_MASK {
            0x00 => Command::Data,
            0x40 => Command::Open,
            0x80 => Command::Close,
            0xC0 => Command::Ack,
            _ => unreachable!("only two bits are masked"),
        }
    }

    fn bits(self) -> u8 {
        match self {
            Command::Data => 0x00,
            Command::Open => 0x40,
            Command::Close => 0x80,
            Command::Ack => 0xC0,
        }
    }
}

/// The wire header, laid out exactly as it appears on the network.
///
/// `Unaligned` + `FromBytes`/`IntoBytes` let us read and write this directly
/// against a datagram buffer without a manual byte-by-byte cursor, the same
/// way the teacher's netlink header does for `struct nlmsghdr`.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RawHeader {
    magic: [u8; 4],
    tube_id: [u8; 8],
    flags: u8,
}

/// A parsed SPUD header: command, flags, and tube id, independent of wire
/// layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tube_id: TubeId,
    pub command: Command,
    pub adec: bool,
    pub pdec: bool,
}

impl Header {
    pub fn new(tube_id: TubeId, command: Command) -> Self {
        Self {
            tube_id,
            command,
            adec: false,
            pdec: false,
        }
    }

    fn flags_byte(&self) -> u8 {
        let mut flags = self.command.bits();
        if self.adec {
            flags |= ADEC_BIT;
        }
        if self.pdec {
            flags |= PDEC_BIT;
        }
        flags
    }

    /// Encode just the 13-byte header (no payload) into `out`.
    pub fn encode(&self, out: &mut [u8; HEADER_SIZE]) {
        let raw = RawHeader {
            magic: MAGIC_COOKIE,
            tube_id: *self.tube_id.as_bytes(),
            flags: self.flags_byte(),
        };
        out.copy_from_slice(raw.as_bytes());
    }

    pub fn set_command(&mut self, command: Command) {
        self.command = command;
    }

    pub fn set_adec(&mut self, adec: bool) {
        self.adec = adec;
    }

    pub fn set_pdec(&mut self, pdec: bool) {
        self.pdec = pdec;
    }
}

/// A full decoded packet: header plus an optional CBOR payload tree.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: Header,
    pub payload: Option<cbor::Value>,
}

/// Returns true if `buf` is at least a complete SPUD header and begins with
/// the magic cookie. Does not validate the CBOR payload, if any.
pub fn is_spud(buf: &[u8]) -> bool {
    buf.len() >= HEADER_SIZE && buf[..4] == MAGIC_COOKIE
}

/// Parse a complete SPUD packet (header plus optional CBOR payload) out of a
/// received datagram.
pub fn parse(buf: &[u8]) -> Result<Packet> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::invalid_arg("datagram shorter than a SPUD header"));
    }
    let (raw, rest) = RawHeader::ref_from_prefix(buf)
        .map_err(|_| Error::bad_format("failed to read SPUD header"))?;
    if raw.magic != MAGIC_COOKIE {
        return Err(Error::bad_format("bad magic cookie"));
    }
    // Reserved bits are ignored on receipt, not rejected; only zeroed on send.

    let header = Header {
        tube_id: TubeId::from_bytes(raw.tube_id),
        command: Command::from_bits(raw.flags),
        adec: raw.flags & ADEC_BIT != 0,
        pdec: raw.flags & PDEC_BIT != 0,
    };

    let payload = if rest.is_empty() {
        None
    } else {
        Some(cbor::decode(rest)?)
    };

    Ok(Packet { header, payload })
}

/// Encode a header and an optional CBOR payload into a single buffer ready
/// to hand to the socket layer.
pub fn encode(header: &Header, payload: Option<&cbor::Value>) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + 32);
    let mut head = [0u8; HEADER_SIZE];
    header.encode(&mut head);
    out.extend_from_slice(&head);
    if let Some(value) = payload {
        cbor::encode(value, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::TubeId;

    fn sample_id() -> TubeId {
        TubeId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8])
    }

    #[test]
    fn rejects_short_buffer() {
        let buf = [0u8; 4];
        assert!(!is_spud(&buf));
        assert!(parse(&buf).is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = 0xff;
        assert!(!is_spud(&buf));
    }

    #[test]
    fn round_trips_header_only_data_packet() {
        let header = Header::new(sample_id(), Command::Data);
        let encoded = encode(&header, None);
        assert_eq!(encoded.len(), HEADER_SIZE);
        assert!(is_spud(&encoded));

        let packet = parse(&encoded).unwrap();
        assert_eq!(packet.header, header);
        assert!(packet.payload.is_none());
    }

    #[test]
    fn round_trips_open_with_adec_and_pdec() {
        let mut header = Header::new(sample_id(), Command::Open);
        header.set_adec(true);
        header.set_pdec(true);
        let encoded = encode(&header, None);

        let packet = parse(&encoded).unwrap();
        assert_eq!(packet.header.command, Command::Open);
        assert!(packet.header.adec);
        assert!(packet.header.pdec);
    }

    #[test]
    fn ignores_reserved_flag_bits_on_receipt() {
        let header = Header::new(sample_id(), Command::Data);
        let mut encoded = encode(&header, None);
        encoded[12] |= 0x01;
        let packet = parse(&encoded).unwrap();
        assert_eq!(packet.header.command, Command::Data);
    }

    /// Worked example: a DATA packet with no payload, the minimal legal
    /// SPUD datagram.
    #[test]
    fn parses_minimal_data_packet() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC_COOKIE);
        buf.extend_from_slice(&[0xaa; 8]);
        buf.push(0x00);
        let packet = parse(&buf).unwrap();
        assert_eq!(packet.header.command, Command::Data);
        assert_eq!(packet.header.tube_id, TubeId::from_bytes([0xaa; 8]));
    }

    /// Worked example: an ACK carries ADEC set and no payload.
    #[test]
    fn parses_ack_with_adec() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC_COOKIE);
        buf.extend_from_slice(&[0x01; 8]);
        buf.push(0xC0 | ADEC_BIT);
        let packet = parse(&buf).unwrap();
        assert_eq!(packet.header.command, Command::Ack);
        assert!(packet.header.adec);
        assert!(!packet.header.pdec);
    }

    /// Worked example: a CLOSE with a one-byte truncated trailer is rejected
    /// as soon as the CBOR decoder sees it, not silently dropped.
    #[test]
    fn parses_close_rejects_truncated_cbor_trailer() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&MAGIC_COOKIE);
        buf.extend_from_slice(&[0x02; 8]);
        buf.push(0x80);
        buf.push(0x82); // CBOR array of length 2, but nothing follows
        assert!(parse(&buf).is_err());
    }

    /// Worked example 1: the exact 17-byte packet — a DATA packet whose
    /// payload is `{0: h'61'}`.
    #[test]
    fn parses_worked_example_one() {
        let buf: [u8; 17] = [
            0xD8, 0x00, 0x00, 0xD8, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x00, 0xA1,
            0x00, 0x41, 0x61,
        ];
        assert!(is_spud(&buf));

        let packet = parse(&buf).unwrap();
        assert_eq!(
            packet.header.tube_id,
            TubeId::from_bytes([0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08])
        );
        assert_eq!(packet.header.command, Command::Data);
        assert!(!packet.header.adec);
        assert!(!packet.header.pdec);

        let payload = packet.payload.expect("packet carries a CBOR payload");
        assert_eq!(
            payload,
            cbor::Value::Map(vec![(cbor::Value::uint(0), cbor::Value::bytes(vec![0x61]))])
        );
    }

    /// Worked example 2: a 12-byte datagram, one short of a full header.
    #[test]
    fn worked_example_two_rejects_short_packet() {
        let buf: [u8; 12] = [0xD8, 0x00, 0x00, 0xD8, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert!(!is_spud(&buf));
        assert!(matches!(parse(&buf), Err(Error::InvalidArg(_))));
    }

    /// Worked example 3: bad magic cookie, otherwise a full-length datagram.
    #[test]
    fn worked_example_three_rejects_bad_magic() {
        let mut buf = [0u8; 13];
        buf[0..4].copy_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        assert!(!is_spud(&buf));
        assert!(matches!(parse(&buf), Err(Error::BadFormat(_))));
    }
}
