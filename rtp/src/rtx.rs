use bytes::{BufMut, BytesMut};

use crate::header::read_sequence_number;

/// Rewrap a stored media packet for the retransmission stream.
///
/// RFC 4588 framing: the RTX packet reuses the original header with the
/// retransmission stream's payload type, sequence number and SSRC
/// substituted, and carries the original sequence number (OSN) in the
/// first two payload bytes:
///
/// ```bash
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                         RTP Header                            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |            OSN                |                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+                               |
/// |                  Original RTP Packet Payload                  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// `payload_type` of `None` keeps the original payload type byte; a set
/// value replaces it while preserving the marker bit. The result is a
/// fresh buffer two bytes longer than the input.
///
/// # Unit Test
///
/// ```
/// let original = [
///     0x80, 0xe0, 0x04, 0xf1, 0xf8, 0x87, 0x3f, 0xad, 0x67, 0xfe,
///     0x9d, 0xfc, 0xaa, 0xbb
/// ];
///
/// let wrapped = rtp::rtx::wrap(&original, 12, Some(97), 2000, 0x11223344);
/// assert_eq!(
///     &wrapped[..],
///     &[
///         0x80, 0xe1, 0x07, 0xd0, 0xf8, 0x87, 0x3f, 0xad, 0x11, 0x22,
///         0x33, 0x44, 0x04, 0xf1, 0xaa, 0xbb
///     ][..],
/// );
/// ```
pub fn wrap(
    packet: &[u8],
    header_len: usize,
    payload_type: Option<u8>,
    sequence_number: u16,
    ssrc: u32,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(packet.len() + 2);
    buf.extend_from_slice(&packet[..header_len]);

    if let Some(payload_type) = payload_type {
        buf[1] = (buf[1] & 0x80) | (payload_type & 0x7F);
    }

    buf[2..4].copy_from_slice(&sequence_number.to_be_bytes());
    buf[8..12].copy_from_slice(&ssrc.to_be_bytes());

    buf.put_u16(read_sequence_number(packet));
    buf.extend_from_slice(&packet[header_len..]);
    buf
}
