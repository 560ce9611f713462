use ahash::AHashMap;
use rand::{thread_rng, Rng};
use rtp::extension::ExtensionMap;

use crate::statistics::NackWindow;
use crate::{
    Error, Payload, PayloadFormat, RtpState, SsrcAllocator, VideoCodec, IP_PACKET_SIZE,
    MAX_INIT_SEQUENCE, RTX_OFF,
};

/// Everything behind the send critical section: the protocol state
/// machine proper.
///
/// Methods here are pure state policy; the engine in
/// [`crate::sender`] owns the lock and the collaborator callouts.
pub(crate) struct SendState {
    pub sending_media: bool,
    pub max_payload_length: usize,
    pub packet_overhead: usize,
    pub payload_type: i8,
    pub payloads: AHashMap<i8, Payload>,
    pub extensions: ExtensionMap,
    pub transmission_time_offset: i32,
    pub absolute_send_time: u32,
    pub start_timestamp_forced: bool,
    pub start_timestamp: u32,
    pub sequence_number_forced: bool,
    pub sequence_number: u16,
    pub sequence_number_rtx: u16,
    pub ssrc_forced: bool,
    pub ssrc: u32,
    pub ssrc_rtx: u32,
    pub timestamp: u32,
    pub capture_time_ms: i64,
    pub last_timestamp_time_ms: i64,
    pub media_has_been_sent: bool,
    pub last_packet_marker_bit: bool,
    pub csrcs: Vec<u32>,
    pub include_csrcs: bool,
    pub rtx_mode: u8,
    pub payload_type_rtx: i8,
    /// Audio senders: the negotiated RED payload type, `-1` when unset.
    pub red_payload_type: i8,
    /// Video senders: `(red, fec)` payload types when FEC is enabled.
    pub fec: Option<(u8, u8)>,
    pub video_codec: VideoCodec,
    pub video_max_bitrate: u32,
    pub nack: NackWindow,
}

impl SendState {
    pub fn new(ssrc_allocator: &dyn SsrcAllocator) -> Self {
        let mut rng = thread_rng();
        Self {
            sending_media: true,
            // IPv4 + UDP overhead by default.
            max_payload_length: IP_PACKET_SIZE - 28,
            packet_overhead: 28,
            payload_type: -1,
            payloads: AHashMap::new(),
            extensions: ExtensionMap::default(),
            transmission_time_offset: 0,
            absolute_send_time: 0,
            start_timestamp_forced: false,
            start_timestamp: 0,
            sequence_number_forced: false,
            sequence_number: rng.gen_range(1..=MAX_INIT_SEQUENCE),
            sequence_number_rtx: rng.gen_range(1..=MAX_INIT_SEQUENCE),
            ssrc_forced: false,
            ssrc: ssrc_allocator.allocate(),
            ssrc_rtx: ssrc_allocator.allocate(),
            timestamp: 0,
            capture_time_ms: 0,
            last_timestamp_time_ms: 0,
            media_has_been_sent: false,
            last_packet_marker_bit: false,
            csrcs: Vec::new(),
            include_csrcs: true,
            rtx_mode: RTX_OFF,
            payload_type_rtx: -1,
            red_payload_type: -1,
            fec: None,
            video_codec: VideoCodec::Generic,
            video_max_bitrate: 0,
            nack: NackWindow::default(),
        }
    }

    /// Map a payload type number to a descriptor.
    ///
    /// Re-registration with a compatible descriptor is accepted: audio
    /// matches on name and frequency with the rate-zero rule (a zero
    /// rate on either side is compatible, and the stored rate picks up
    /// the nonzero value), video matches on name and kind. Anything else
    /// under an occupied number is a conflict.
    pub fn register_payload(
        &mut self,
        payload_type: i8,
        payload: Payload,
        audio_configured: bool,
    ) -> Result<(), Error> {
        if payload_type < 0 {
            return Err(Error::InvalidPayloadType(payload_type));
        }

        if let Some(existing) = self.payloads.get_mut(&payload_type) {
            if existing.name.eq_ignore_ascii_case(&payload.name) {
                match (&mut existing.format, &payload.format) {
                    (
                        PayloadFormat::Audio {
                            frequency,
                            rate: existing_rate,
                            ..
                        },
                        PayloadFormat::Audio {
                            frequency: new_frequency,
                            rate: new_rate,
                            ..
                        },
                    ) if audio_configured
                        && *frequency == *new_frequency
                        && (*existing_rate == *new_rate || *existing_rate == 0 || *new_rate == 0) =>
                    {
                        if *new_rate != 0 {
                            *existing_rate = *new_rate;
                        }
                        return Ok(());
                    }
                    (PayloadFormat::Video { .. }, PayloadFormat::Video { .. })
                        if !audio_configured =>
                    {
                        return Ok(());
                    }
                    _ => {}
                }
            }

            return Err(Error::UnregisteredPayload(payload_type));
        }

        self.payloads.insert(payload_type, payload);
        Ok(())
    }

    pub fn deregister_payload(&mut self, payload_type: i8) -> Result<(), Error> {
        self.payloads
            .remove(&payload_type)
            .map(|_| ())
            .ok_or(Error::InvalidPayloadType(payload_type))
    }

    /// Select the active payload type for an outgoing frame.
    ///
    /// Returns the video codec the packetizer should run with, or `None`
    /// when the caller's generic default applies (audio, RED
    /// passthrough, or a kind mismatch). A mismatch between the
    /// descriptor's kind and the sender's mode is accepted and records
    /// the new active payload type, but deliberately changes nothing
    /// else.
    pub fn check_payload_type(
        &mut self,
        payload_type: i8,
        audio_configured: bool,
    ) -> Result<Option<VideoCodec>, Error> {
        if payload_type < 0 {
            log::error!("invalid payload type: {}", payload_type);
            return Err(Error::InvalidPayloadType(payload_type));
        }

        if audio_configured && self.red_payload_type >= 0 && self.red_payload_type == payload_type {
            return Ok(None);
        }

        if self.payload_type == payload_type {
            if !audio_configured {
                return Ok(Some(self.video_codec));
            }
            return Ok(None);
        }

        let Some(payload) = self.payloads.get(&payload_type) else {
            log::warn!("payload type {} not registered", payload_type);
            return Err(Error::InvalidPayloadType(payload_type));
        };

        self.payload_type = payload_type;
        match payload.format {
            PayloadFormat::Video { codec, max_bitrate } if !audio_configured => {
                self.video_codec = codec;
                self.video_max_bitrate = max_bitrate;
                Ok(Some(codec))
            }
            PayloadFormat::Audio { .. } if audio_configured => Ok(None),
            _ => {
                log::warn!(
                    "payload type {} kind does not match the sender mode",
                    payload_type
                );
                Ok(None)
            }
        }
    }

    /// RTP clock rate the sender runs at: the active audio payload's
    /// frequency, or the fixed 90 kHz video clock.
    pub fn payload_frequency(&self, audio_configured: bool) -> u32 {
        if !audio_configured {
            return 90_000;
        }

        match self.payloads.get(&self.payload_type).map(|p| &p.format) {
            Some(PayloadFormat::Audio { frequency, .. }) => *frequency,
            _ => 8000,
        }
    }

    pub fn set_start_timestamp(&mut self, timestamp: u32, force: bool) {
        if force {
            self.start_timestamp_forced = true;
            self.start_timestamp = timestamp;
        } else if !self.start_timestamp_forced {
            self.start_timestamp = timestamp;
        }
    }

    /// Externally chosen media SSRC. Releases the previous identifier,
    /// latches the forced flag and re-rolls the sequence number unless
    /// that was forced too.
    pub fn set_ssrc(&mut self, ssrc: u32, allocator: &dyn SsrcAllocator) {
        if self.ssrc == ssrc && self.ssrc_forced {
            return;
        }

        self.ssrc_forced = true;
        allocator.release(self.ssrc);
        allocator.register(ssrc);
        self.ssrc = ssrc;
        if !self.sequence_number_forced {
            self.sequence_number = thread_rng().gen_range(1..=MAX_INIT_SEQUENCE);
        }
    }

    /// Draw a fresh SSRC unless one was configured through the API.
    pub fn generate_new_ssrc(&mut self, allocator: &dyn SsrcAllocator) -> Option<u32> {
        if self.ssrc_forced {
            return None;
        }

        allocator.release(self.ssrc);
        self.ssrc = allocator.allocate();
        Some(self.ssrc)
    }

    /// Disabling the stream rotates identity so a later restart does not
    /// continue the old sequence space.
    pub fn rotate_on_disable(&mut self, allocator: &dyn SsrcAllocator) {
        if !self.ssrc_forced {
            allocator.release(self.ssrc);
            self.ssrc = allocator.allocate();
        }

        if !self.sequence_number_forced && !self.ssrc_forced {
            self.sequence_number = thread_rng().gen_range(1..=MAX_INIT_SEQUENCE);
        }
    }

    pub fn set_csrcs(&mut self, csrcs: &[u32]) {
        debug_assert!(csrcs.len() <= rtp::CSRC_MAX);
        self.csrcs = csrcs[..csrcs.len().min(rtp::CSRC_MAX)].to_vec();
    }

    pub fn rtp_state(&self) -> RtpState {
        RtpState {
            sequence_number: self.sequence_number,
            start_timestamp: self.start_timestamp,
            timestamp: self.timestamp,
            capture_time_ms: self.capture_time_ms,
            last_timestamp_time_ms: self.last_timestamp_time_ms,
            media_has_been_sent: self.media_has_been_sent,
        }
    }

    pub fn set_rtp_state(&mut self, state: &RtpState) {
        self.set_start_timestamp(state.start_timestamp, true);
        self.sequence_number = state.sequence_number;
        self.sequence_number_forced = true;
        self.timestamp = state.timestamp;
        self.capture_time_ms = state.capture_time_ms;
        self.last_timestamp_time_ms = state.last_timestamp_time_ms;
        self.media_has_been_sent = state.media_has_been_sent;
    }

    pub fn rtx_rtp_state(&self) -> RtpState {
        RtpState {
            sequence_number: self.sequence_number_rtx,
            start_timestamp: self.start_timestamp,
            ..Default::default()
        }
    }

    pub fn set_rtx_rtp_state(&mut self, state: &RtpState) {
        self.sequence_number_rtx = state.sequence_number;
    }
}
