use std::convert::TryFrom;

use anyhow::ensure;
use bytes::{Buf, BufMut, BytesMut};

const MARKER_MASK: u8 = 0b10000000;
const VERSION_MASK: u8 = 0b11000000;
const PADDING_MASK: u8 = 0b00100000;
const EXTENSION_MASK: u8 = 0b00010000;
const CSRC_COUNT_MASK: u8 = 0b00001111;
const PAYLOAD_TYPE_MASK: u8 = 0b01111111;

/// Fixed part of the RTP header, 12 bytes plus the CSRC list.
///
/// ```bash
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |V=2|P|X|  CC   |M|     PT      |       sequence number         |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |                           timestamp                           |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///  |           synchronization source (SSRC) identifier            |
///  +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
///  |            contributing source (CSRC) identifiers             |
///  |                             ....                              |
///  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The extension block, when the X bit is set, is appended separately by
/// [`crate::extension::ExtensionMap::encode_block`]; the builder here only
/// reserves the flag.
#[derive(Debug, Clone)]
pub struct Header {
    /// If set, the packet ends with padding octets; the last octet counts
    /// how many, including itself.
    pub padding: bool,
    /// If set, the fixed header is followed by exactly one header
    /// extension block.
    pub extension: bool,
    /// Frame-boundary marker; the interpretation is defined by the
    /// payload profile.
    pub marker: bool,
    /// 7-bit payload type.
    pub payload_type: u8,
    /// Increments by one for each data packet sent; free-running modulo
    /// 2^16.
    pub sequence_number: u16,
    /// Sampling instant of the first octet of the payload.
    pub timestamp: u32,
    /// Synchronization source identifier.
    pub ssrc: u32,
    /// Contributing sources, at most [`crate::CSRC_MAX`].
    pub csrcs: Vec<u32>,
}

impl Header {
    /// Length of the encoded header, extension block excluded.
    pub fn len(&self) -> usize {
        12 + self.csrcs.len() * 4
    }

    /// # Unit Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use rtp::header::Header;
    ///
    /// let buffer = [
    ///     0x80, 0xe0, 0x04, 0xf1, 0xf8, 0x87, 0x3f, 0xad, 0x67, 0xfe,
    ///     0x9d, 0xfc
    /// ];
    ///
    /// let header = Header {
    ///     padding: false,
    ///     extension: false,
    ///     marker: true,
    ///     payload_type: 96,
    ///     sequence_number: 1265,
    ///     timestamp: 4169613229,
    ///     ssrc: 1744739836,
    ///     csrcs: Vec::new(),
    /// };
    ///
    /// let mut writer = BytesMut::new();
    /// header.encode(&mut writer);
    /// assert_eq!(&writer[..], &buffer[..]);
    /// ```
    #[rustfmt::skip]
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut basic = [0u8; 2];

        basic[0] = 2 << 6;
        if self.padding { basic[0] |= PADDING_MASK; }
        if self.extension { basic[0] |= EXTENSION_MASK; }
        basic[0] |= (self.csrcs.len() as u8) & CSRC_COUNT_MASK;

        if self.marker { basic[1] |= MARKER_MASK; }
        basic[1] |= self.payload_type & PAYLOAD_TYPE_MASK;

        buf.put(&basic[..]);
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for item in &self.csrcs {
            buf.put_u32(*item);
        }
    }
}

/// Borrowed view of an encoded RTP packet.
///
/// Unlike [`Header`] this walks the whole wire image: the CSRC list, the
/// extension block and the padding trailer, so callers get the real header
/// length and payload boundaries back.
#[derive(Debug, Clone)]
pub struct Packet<'a> {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc_count: usize,
    /// Bytes before the payload: fixed header, CSRCs and extension block.
    pub header_len: usize,
    /// Trailing padding octets, including the count octet itself.
    pub padding_len: usize,
    pub payload: &'a [u8],
}

impl<'a> TryFrom<&'a [u8]> for Packet<'a> {
    type Error = anyhow::Error;

    /// # Unit Test
    ///
    /// ```
    /// use std::convert::TryFrom;
    /// use rtp::header::Packet;
    ///
    /// let buffer = [
    ///     0xb0, 0xe0, 0x04, 0xf1, 0xf8, 0x87, 0x3f, 0xad, 0x67, 0xfe,
    ///     0x9d, 0xfc, 0xbe, 0xde, 0x00, 0x01, 0x22, 0x00, 0x01, 0xc2,
    ///     0x01, 0x02, 0x03, 0x00, 0x00, 0x04,
    /// ];
    ///
    /// let packet = Packet::try_from(&buffer[..]).unwrap();
    /// assert_eq!(packet.marker, true);
    /// assert_eq!(packet.payload_type, 96);
    /// assert_eq!(packet.sequence_number, 1265);
    /// assert_eq!(packet.timestamp, 4169613229);
    /// assert_eq!(packet.ssrc, 1744739836);
    /// assert_eq!(packet.csrc_count, 0);
    /// assert_eq!(packet.header_len, 20);
    /// assert_eq!(packet.padding_len, 4);
    /// assert_eq!(packet.payload, &[0x01, 0x02]);
    /// ```
    #[rustfmt::skip]
    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        ensure!(buf.len() >= 12, "buf len < 12");

        let version = (buf[0] & VERSION_MASK) >> 6;
        ensure!(version == 2, "rtp version is not rfc3550!");

        let has_padding = (buf[0] & PADDING_MASK) != 0;
        let has_extension = (buf[0] & EXTENSION_MASK) != 0;
        let csrc_count = (buf[0] & CSRC_COUNT_MASK) as usize;
        let marker = (buf[1] & MARKER_MASK) != 0;
        let payload_type = buf[1] & PAYLOAD_TYPE_MASK;

        let mut reader = &buf[2..];
        ensure!(reader.remaining() >= 10 + csrc_count * 4, "buf len is too short!");

        let sequence_number = reader.get_u16();
        let timestamp = reader.get_u32();
        let ssrc = reader.get_u32();
        reader.advance(csrc_count * 4);

        let mut header_len = 12 + csrc_count * 4;
        if has_extension {
            ensure!(reader.remaining() >= 4, "truncated extension block!");
            reader.advance(2);
            let words = reader.get_u16() as usize;
            ensure!(reader.remaining() >= words * 4, "truncated extension block!");
            reader.advance(words * 4);
            header_len += 4 + words * 4;
        }

        let padding_len = if has_padding {
            let len = buf[buf.len() - 1] as usize;
            ensure!(len >= 1 && header_len + len <= buf.len(), "invalid padding trailer!");
            len
        } else {
            0
        };

        Ok(Self {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc_count,
            header_len,
            padding_len,
            payload: &buf[header_len..buf.len() - padding_len],
        })
    }
}

/// Flip the padding flag on an already encoded packet.
pub fn set_padding_bit(packet: &mut [u8]) {
    packet[0] |= PADDING_MASK;
}

/// Sequence number straight off the wire, no full parse.
///
/// # Unit Test
///
/// ```
/// let buffer = [
///     0x80, 0x60, 0x04, 0xf1, 0xf8, 0x87, 0x3f, 0xad, 0x67, 0xfe,
///     0x9d, 0xfc
/// ];
///
/// assert_eq!(rtp::header::read_sequence_number(&buffer), 1265);
/// ```
pub fn read_sequence_number(packet: &[u8]) -> u16 {
    u16::from_be_bytes([packet[2], packet[3]])
}
