//! ## RTP: A Transport Protocol for Real-Time Applications
//!
//! RTP provides end-to-end delivery services for data with real-time
//! characteristics, such as interactive audio and video. Those services
//! include payload type identification, sequence numbering, timestamping
//! and delivery monitoring. RTP itself does not provide any mechanism to
//! ensure timely delivery or provide other quality-of-service
//! guarantees; the sequence numbers included in RTP allow the receiver
//! to reconstruct the sender's packet sequence.
//!
//! This crate covers the sender-side wire format only: building the
//! fixed header ([RFC 3550](https://tools.ietf.org/html/rfc3550)),
//! building and patching one-byte-form header extensions
//! ([RFC 5285](https://tools.ietf.org/html/rfc5285)), and rewrapping a
//! stored packet for a retransmission stream
//! ([RFC 4588](https://tools.ietf.org/html/rfc4588)).

pub mod extension;
pub mod header;
pub mod rtx;

use bytes::BytesMut;

pub use extension::{ExtensionKind, ExtensionMap};
pub use header::{Header, Packet};

/// A mixer can identify at most 15 contributing sources in one packet.
pub const CSRC_MAX: usize = 15;

/// Encode the full header: fixed part, CSRC list and extension block.
///
/// The X bit is derived from the map, the extension elements carry the
/// given current 24-bit state values. Returns the header length in
/// bytes.
///
/// # Unit Test
///
/// ```
/// use bytes::BytesMut;
/// use rtp::extension::{ExtensionKind, ExtensionMap};
/// use rtp::header::Header;
///
/// let mut map = ExtensionMap::default();
/// map.register(ExtensionKind::AbsoluteSendTime, 2).unwrap();
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
/// assert_eq!(rtp::build_header(&mut writer, header, &map, 0, 450), 20);
/// assert_eq!(
///     &writer[..],
///     &[
///         0x90, 0xe0, 0x04, 0xf1, 0xf8, 0x87, 0x3f, 0xad, 0x67, 0xfe,
///         0x9d, 0xfc, 0xbe, 0xde, 0x00, 0x01, 0x22, 0x00, 0x01, 0xc2
///     ][..],
/// );
/// ```
pub fn build_header(
    buf: &mut BytesMut,
    mut header: Header,
    extensions: &ExtensionMap,
    transmission_offset: i32,
    absolute_send_time: u32,
) -> usize {
    header.extension = !extensions.is_empty();
    header.encode(buf);
    header.len() + extensions.encode_block(buf, transmission_offset, absolute_send_time)
}
