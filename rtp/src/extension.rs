use bytes::{BufMut, BytesMut};

/// One-byte-form extension profile marker, RFC 5285.
///
/// In the one-byte header form of extensions, the 16-bit value required
/// by the RTP specification for a header extension, labeled in the RTP
/// specification as "defined by profile", takes the fixed bit pattern
/// 0xBEDE.
pub const ONE_BYTE_PROFILE: [u8; 2] = [0xBE, 0xDE];

/// Length of the `0xBEDE` + word-count prefix of the extension block.
pub const BLOCK_HEADER_LEN: usize = 4;

/// Every extension element defined here occupies 4 bytes on the wire,
/// the ID/len octet included, so the block stays 32-bit aligned without
/// trailing pad octets.
pub const ELEMENT_LEN: usize = 4;

/// The closed set of header extensions the sender knows how to build and
/// patch in place.
///
/// Each element starts with a byte containing an ID and a length:
///
/// ```bash
/// 0
/// 0 1 2 3 4 5 6 7
/// +-+-+-+-+-+-+-+-+
/// |  ID   |  len  |
/// +-+-+-+-+-+-+-+-+
/// ```
///
/// The 4-bit ID is the local identifier of this element, in the range
/// 1-14 inclusive; the 4-bit length is the number minus one of data
/// bytes following the header octet. The discriminant order here is the
/// deterministic order elements are laid out in the block.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExtensionKind {
    /// Transmission time offsets in RTP streams, RFC 5450. 24-bit signed
    /// offset in 90 kHz units, added to the RTP timestamp to get the
    /// effective transmission time.
    TransmissionTimeOffset = 0,
    /// Client-to-mixer audio level indication. One byte
    /// `V | level(dBov)`, plus two pad octets to keep the element at 4
    /// bytes.
    AudioLevel = 1,
    /// Absolute send time: the sender's wall clock at transmit, in
    /// seconds as a 24-bit fixed point number with 18 fractional bits.
    AbsoluteSendTime = 2,
}

impl ExtensionKind {
    /// Layout order for the extension block.
    pub const ALL: [ExtensionKind; 3] = [
        ExtensionKind::TransmissionTimeOffset,
        ExtensionKind::AudioLevel,
        ExtensionKind::AbsoluteSendTime,
    ];

    /// Value of the 4-bit `len` field: data bytes minus one.
    fn len_field(self) -> u8 {
        match self {
            ExtensionKind::TransmissionTimeOffset => 2,
            ExtensionKind::AudioLevel => 0,
            ExtensionKind::AbsoluteSendTime => 2,
        }
    }
}

/// Registered extensions of one sender: kind to user-assigned ID, plus
/// the cached byte offset of each element from the start of the block.
///
/// Offsets are recomputed on every registration change so that in-place
/// patching of an already encoded packet never has to re-walk the block.
#[derive(Debug, Default, Clone)]
pub struct ExtensionMap {
    ids: [Option<u8>; 3],
    offsets: [usize; 3],
    total_len: usize,
}

impl ExtensionMap {
    /// Register `kind` under a local identifier in `[1, 14]`.
    ///
    /// Re-registering a kind under its current ID is a no-op; a different
    /// ID for an already registered kind is rejected.
    ///
    /// # Unit Test
    ///
    /// ```
    /// use rtp::extension::{ExtensionKind, ExtensionMap};
    ///
    /// let mut map = ExtensionMap::default();
    /// assert!(map.register(ExtensionKind::AbsoluteSendTime, 2).is_ok());
    /// assert!(map.register(ExtensionKind::AbsoluteSendTime, 2).is_ok());
    /// assert!(map.register(ExtensionKind::AbsoluteSendTime, 3).is_err());
    /// assert!(map.register(ExtensionKind::AudioLevel, 15).is_err());
    /// assert_eq!(map.total_len(), 8);
    /// ```
    pub fn register(&mut self, kind: ExtensionKind, id: u8) -> anyhow::Result<()> {
        anyhow::ensure!((1..=14).contains(&id), "extension id out of range");
        match self.ids[kind as usize] {
            Some(current) if current != id => {
                anyhow::bail!("extension registered under a different id")
            }
            _ => self.ids[kind as usize] = Some(id),
        }

        self.rebuild_offsets();
        Ok(())
    }

    pub fn deregister(&mut self, kind: ExtensionKind) {
        self.ids[kind as usize] = None;
        self.rebuild_offsets();
    }

    pub fn id(&self, kind: ExtensionKind) -> Option<u8> {
        self.ids[kind as usize]
    }

    pub fn is_registered(&self, kind: ExtensionKind) -> bool {
        self.ids[kind as usize].is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.iter().all(Option::is_none)
    }

    /// Total encoded length of the block, `0xBEDE` prefix included; zero
    /// when nothing is registered.
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Cached offset of an element from the first profile byte.
    pub fn offset(&self, kind: ExtensionKind) -> Option<usize> {
        self.ids[kind as usize].map(|_| self.offsets[kind as usize])
    }

    fn rebuild_offsets(&mut self) {
        let mut running = BLOCK_HEADER_LEN;
        for kind in ExtensionKind::ALL {
            if self.ids[kind as usize].is_some() {
                self.offsets[kind as usize] = running;
                running += ELEMENT_LEN;
            }
        }

        self.total_len = if running > BLOCK_HEADER_LEN { running } else { 0 };
    }

    /// Append the one-byte-form extension block to a packet under
    /// construction.
    ///
    /// `transmission_offset` and `absolute_send_time` are the current
    /// 24-bit state values; the audio level element is written as the
    /// voice=1, 0 dBov placeholder and only gets a real value through
    /// [`ExtensionMap::patch_audio_level`]. Returns the number of bytes
    /// appended.
    ///
    /// # Unit Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use rtp::extension::{ExtensionKind, ExtensionMap};
    ///
    /// let buffer = [
    ///     0xbe, 0xde, 0x00, 0x02, 0x32, 0x00, 0x01, 0xc2,
    ///     0x22, 0x06, 0x00, 0x00
    /// ];
    ///
    /// let mut map = ExtensionMap::default();
    /// map.register(ExtensionKind::TransmissionTimeOffset, 3).unwrap();
    /// map.register(ExtensionKind::AbsoluteSendTime, 2).unwrap();
    ///
    /// let mut writer = BytesMut::new();
    /// assert_eq!(map.encode_block(&mut writer, 450, 393216), 12);
    /// assert_eq!(&writer[..], &buffer[..]);
    /// ```
    #[rustfmt::skip]
    pub fn encode_block(
        &self,
        buf: &mut BytesMut,
        transmission_offset: i32,
        absolute_send_time: u32,
    ) -> usize {
        if self.is_empty() {
            return 0;
        }

        debug_assert!((self.total_len - BLOCK_HEADER_LEN) % 4 == 0);
        buf.put(&ONE_BYTE_PROFILE[..]);
        buf.put_u16(((self.total_len - BLOCK_HEADER_LEN) / 4) as u16);

        for kind in ExtensionKind::ALL {
            let Some(id) = self.ids[kind as usize] else {
                continue;
            };

            buf.put_u8((id << 4) | kind.len_field());
            match kind {
                ExtensionKind::TransmissionTimeOffset => {
                    buf.put_int(transmission_offset as i64, 3);
                }
                ExtensionKind::AudioLevel => {
                    // Voice, 0 dBov, then two pad octets.
                    buf.put_u8(1 << 7);
                    buf.put_u16(0);
                }
                ExtensionKind::AbsoluteSendTime => {
                    buf.put_uint(absolute_send_time as u64 & 0x00FF_FFFF, 3);
                }
            }
        }

        self.total_len
    }

    /// Rewrite the transmission offset element of an encoded packet with
    /// `diff_ms` converted to 90 kHz units.
    pub fn patch_transmission_offset(
        &self,
        packet: &mut [u8],
        csrc_count: usize,
        header_len: usize,
        diff_ms: i64,
    ) -> bool {
        let Some(pos) =
            self.element_pos(ExtensionKind::TransmissionTimeOffset, packet, csrc_count, header_len)
        else {
            return false;
        };

        let value = (diff_ms * 90) as i32;
        packet[pos + 1..pos + 4].copy_from_slice(&value.to_be_bytes()[1..]);
        true
    }

    /// Rewrite the absolute send time element with `now_ms` as 6.18
    /// fixed-point seconds.
    ///
    /// # Unit Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use rtp::extension::{ExtensionKind, ExtensionMap};
    ///
    /// let mut map = ExtensionMap::default();
    /// map.register(ExtensionKind::AbsoluteSendTime, 2).unwrap();
    ///
    /// let mut packet = BytesMut::from(
    ///     &[
    ///         0x90, 0x60, 0x04, 0xf1, 0xf8, 0x87, 0x3f, 0xad, 0x67, 0xfe,
    ///         0x9d, 0xfc
    ///     ][..],
    /// );
    /// map.encode_block(&mut packet, 0, 0);
    ///
    /// assert!(map.patch_absolute_send_time(&mut packet, 0, 20, 1500));
    /// assert_eq!(&packet[16..], &[0x22, 0x06, 0x00, 0x00]);
    /// ```
    pub fn patch_absolute_send_time(
        &self,
        packet: &mut [u8],
        csrc_count: usize,
        header_len: usize,
        now_ms: i64,
    ) -> bool {
        let Some(pos) =
            self.element_pos(ExtensionKind::AbsoluteSendTime, packet, csrc_count, header_len)
        else {
            return false;
        };

        let value = (((now_ms << 18) / 1000) & 0x00FF_FFFF) as u32;
        packet[pos + 1..pos + 4].copy_from_slice(&value.to_be_bytes()[1..]);
        true
    }

    /// Rewrite the audio level value byte.
    pub fn patch_audio_level(
        &self,
        packet: &mut [u8],
        csrc_count: usize,
        header_len: usize,
        voiced: bool,
        dbov: u8,
    ) -> bool {
        let Some(pos) =
            self.element_pos(ExtensionKind::AudioLevel, packet, csrc_count, header_len)
        else {
            return false;
        };

        packet[pos + 1] = if voiced { 0x80 } else { 0x00 } | (dbov & 0x7F);
        true
    }

    /// Locate and validate one element of an already encoded packet.
    ///
    /// An unregistered kind is a quiet skip; a registered kind whose
    /// bytes do not look like the block we would have built is logged and
    /// skipped, leaving the packet untouched either way.
    fn element_pos(
        &self,
        kind: ExtensionKind,
        packet: &[u8],
        csrc_count: usize,
        header_len: usize,
    ) -> Option<usize> {
        let id = self.ids[kind as usize]?;
        let block_start = 12 + csrc_count * 4;
        let pos = block_start + self.offsets[kind as usize];

        if packet.len() < pos + ELEMENT_LEN || header_len < pos + ELEMENT_LEN {
            log::warn!("failed to patch {:?}: invalid length", kind);
            return None;
        }

        if packet[block_start..block_start + 2] != ONE_BYTE_PROFILE {
            log::warn!("failed to patch {:?}: extension block not found", kind);
            return None;
        }

        if packet[pos] != (id << 4) | kind.len_field() {
            log::warn!("failed to patch {:?}: unexpected element header", kind);
            return None;
        }

        Some(pos)
    }
}
