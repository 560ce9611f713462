use std::convert::TryFrom;
use std::sync::Arc;

use ahash::AHashMap;
use bytes::BytesMut;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rtp::extension::ExtensionKind;
use rtp::header::{self, Header, Packet};

use crate::history::PacketHistory;
use crate::state::SendState;
use crate::statistics::{BitrateTracker, SendDelayWindow, StreamDataCounters};
use crate::{
    AudioPacketizer, BitrateObserver, Clock, Error, Fragmentation, FrameCountObserver, FrameType,
    Options, Pacer, Priority, RtpState, SendSideDelayObserver, SendSink, SsrcAllocator, Storage,
    StreamDataCountersCallback, Transport, VideoCodec, VideoPacketizer, IP_PACKET_SIZE,
    MAX_PADDING_LEN, RTX_OFF, RTX_REDUNDANT_PAYLOADS, RTX_RETRANSMITTED,
};

struct Statistics {
    rtp: StreamDataCounters,
    rtx: StreamDataCounters,
    bitrate_sent: BitrateTracker,
    nack_bitrate: BitrateTracker,
    send_delays: SendDelayWindow,
    frame_counts: AHashMap<FrameType, u32>,
    callback: Option<Arc<dyn StreamDataCountersCallback>>,
}

/// The RTP packetization and transmission engine.
///
/// One instance per outgoing stream pair (media plus its RTX stream).
/// Multiple threads may call in concurrently: the typical producers are
/// an encoder thread feeding [`RtpSender::send_outgoing_data`], an RTCP
/// thread feeding [`RtpSender::on_received_nack`] and the pacer thread
/// calling back through [`RtpSender::time_to_send_packet`] and
/// [`RtpSender::time_to_send_padding`].
///
/// Two locks guard the state: the send section (protocol state machine)
/// and the statistics section (counters, delay window, frame counts).
/// The send section is never acquired while the statistics section is
/// held, and neither is ever held across a Transport or Pacer callout.
pub struct RtpSender {
    id: i32,
    audio_configured: bool,
    clock: Arc<dyn Clock>,
    transport: Option<Arc<dyn Transport>>,
    pacer: Option<Arc<dyn Pacer>>,
    audio: Option<Arc<dyn AudioPacketizer>>,
    video: Option<Arc<dyn VideoPacketizer>>,
    ssrc_allocator: Arc<dyn SsrcAllocator>,
    bitrate_observer: Option<Arc<dyn BitrateObserver>>,
    frame_count_observer: Option<Arc<dyn FrameCountObserver>>,
    send_side_delay_observer: Option<Arc<dyn SendSideDelayObserver>>,
    send: Mutex<SendState>,
    target_bitrate: Mutex<u32>,
    history: PacketHistory,
    /// Padding bodies only; seeded per sender so padding streams are not
    /// globally synchronized.
    padding_rng: Mutex<SmallRng>,
    statistics: Mutex<Statistics>,
}

impl RtpSender {
    pub fn new(options: Options) -> Self {
        let send = SendState::new(&*options.ssrc_allocator);
        let padding_rng = SmallRng::seed_from_u64(options.clock.now_ms() as u64);

        Self {
            id: options.id,
            audio_configured: options.audio,
            history: PacketHistory::new(options.clock.clone()),
            clock: options.clock,
            transport: options.transport,
            pacer: options.pacer,
            audio: options.audio_packetizer,
            video: options.video_packetizer,
            ssrc_allocator: options.ssrc_allocator,
            bitrate_observer: options.bitrate_observer,
            frame_count_observer: options.frame_count_observer,
            send_side_delay_observer: options.send_side_delay_observer,
            send: Mutex::new(send),
            target_bitrate: Mutex::new(0),
            padding_rng: Mutex::new(padding_rng),
            statistics: Mutex::new(Statistics {
                rtp: StreamDataCounters::default(),
                rtx: StreamDataCounters::default(),
                bitrate_sent: BitrateTracker::default(),
                nack_bitrate: BitrateTracker::default(),
                send_delays: SendDelayWindow::default(),
                frame_counts: AHashMap::new(),
                callback: None,
            }),
        }
    }

    // ---- configuration ------------------------------------------------

    pub fn set_target_bitrate(&self, bitrate_bps: u32) {
        *self.target_bitrate.lock() = bitrate_bps;
    }

    pub fn target_bitrate(&self) -> u32 {
        *self.target_bitrate.lock()
    }

    pub fn register_payload(&self, payload_type: i8, payload: crate::Payload) -> Result<(), Error> {
        self.send
            .lock()
            .register_payload(payload_type, payload, self.audio_configured)
    }

    pub fn deregister_payload(&self, payload_type: i8) -> Result<(), Error> {
        self.send.lock().deregister_payload(payload_type)
    }

    /// Active payload type, `-1` before the first frame.
    pub fn payload_type(&self) -> i8 {
        self.send.lock().payload_type
    }

    pub fn register_extension(&self, kind: ExtensionKind, id: u8) -> Result<(), Error> {
        if !(1..=14).contains(&id) {
            return Err(Error::OutOfRange);
        }

        // In range, so the only way the map refuses is an ID conflict.
        self.send
            .lock()
            .extensions
            .register(kind, id)
            .map_err(|_| Error::ExtensionConflict(kind))
    }

    pub fn deregister_extension(&self, kind: ExtensionKind) {
        self.send.lock().extensions.deregister(kind);
    }

    pub fn extension_total_len(&self) -> usize {
        self.send.lock().extensions.total_len()
    }

    /// 24-bit signed transmission offset state; out of `±(2^23 - 1)` is
    /// refused.
    pub fn set_transmission_time_offset(&self, offset: i32) -> Result<(), Error> {
        if !(-0x7FFFFF..=0x7FFFFF).contains(&offset) {
            return Err(Error::OutOfRange);
        }

        self.send.lock().transmission_time_offset = offset;
        Ok(())
    }

    /// 24-bit unsigned absolute send time state.
    pub fn set_absolute_send_time(&self, time: u32) -> Result<(), Error> {
        if time > 0xFFFFFF {
            return Err(Error::OutOfRange);
        }

        self.send.lock().absolute_send_time = time;
        Ok(())
    }

    pub fn set_max_payload_length(
        &self,
        max_payload_length: usize,
        packet_overhead: usize,
    ) -> Result<(), Error> {
        if !(100..=IP_PACKET_SIZE).contains(&max_payload_length) {
            log::error!("invalid max payload length: {}", max_payload_length);
            return Err(Error::OutOfRange);
        }

        let mut send = self.send.lock();
        send.max_payload_length = max_payload_length;
        send.packet_overhead = packet_overhead;
        Ok(())
    }

    pub fn max_payload_length(&self) -> usize {
        self.send.lock().max_payload_length
    }

    pub fn packet_overhead(&self) -> usize {
        self.send.lock().packet_overhead
    }

    pub fn set_rtx_mode(&self, mode: u8) {
        self.send.lock().rtx_mode = mode;
    }

    /// `(mode, rtx ssrc, rtx payload type)` in one snapshot.
    pub fn rtx_status(&self) -> (u8, u32, i8) {
        let send = self.send.lock();
        (send.rtx_mode, send.ssrc_rtx, send.payload_type_rtx)
    }

    pub fn set_rtx_ssrc(&self, ssrc: u32) {
        self.send.lock().ssrc_rtx = ssrc;
    }

    pub fn rtx_ssrc(&self) -> u32 {
        self.send.lock().ssrc_rtx
    }

    pub fn set_rtx_payload_type(&self, payload_type: i8) {
        self.send.lock().payload_type_rtx = payload_type;
    }

    /// Audio senders only: the negotiated RED payload type.
    pub fn set_red_payload_type(&self, payload_type: i8) -> Result<(), Error> {
        if !self.audio_configured {
            return Err(Error::InvalidPayloadType(payload_type));
        }

        self.send.lock().red_payload_type = payload_type;
        Ok(())
    }

    pub fn red_payload_type(&self) -> Option<i8> {
        let red = self.send.lock().red_payload_type;
        (self.audio_configured && red >= 0).then_some(red)
    }

    /// Video senders only: enable FEC classification for the given RED
    /// and FEC payload types.
    pub fn set_generic_fec_status(
        &self,
        enable: bool,
        red_payload_type: u8,
        fec_payload_type: u8,
    ) -> Result<(), Error> {
        if self.audio_configured {
            return Err(Error::InvalidPayloadType(red_payload_type as i8));
        }

        self.send.lock().fec = enable.then_some((red_payload_type, fec_payload_type));
        Ok(())
    }

    pub fn generic_fec_status(&self) -> Option<(u8, u8)> {
        self.send.lock().fec
    }

    pub fn set_store_packets_status(&self, enable: bool, number_to_store: usize) {
        self.history.set_store_status(enable, number_to_store);
    }

    pub fn store_packets(&self) -> bool {
        self.history.is_enabled()
    }

    pub fn set_statistics_callback(&self, callback: Option<Arc<dyn StreamDataCountersCallback>>) {
        self.statistics.lock().callback = callback;
    }

    // ---- stream identity ----------------------------------------------

    pub fn ssrc(&self) -> u32 {
        self.send.lock().ssrc
    }

    /// Externally chosen media SSRC; re-rolls the sequence number unless
    /// that was forced too.
    pub fn set_ssrc(&self, ssrc: u32) {
        self.send.lock().set_ssrc(ssrc, &*self.ssrc_allocator);
    }

    /// Draw a fresh SSRC, unless one was configured through the API in
    /// which case nothing changes.
    pub fn generate_new_ssrc(&self) -> Option<u32> {
        self.send.lock().generate_new_ssrc(&*self.ssrc_allocator)
    }

    pub fn sequence_number(&self) -> u16 {
        self.send.lock().sequence_number
    }

    pub fn set_sequence_number(&self, sequence_number: u16) {
        let mut send = self.send.lock();
        send.sequence_number_forced = true;
        send.sequence_number = sequence_number;
    }

    /// Claim the next media sequence number without building a packet.
    pub fn increment_sequence_number(&self) -> u16 {
        let mut send = self.send.lock();
        let sequence_number = send.sequence_number;
        send.sequence_number = send.sequence_number.wrapping_add(1);
        sequence_number
    }

    pub fn set_csrcs(&self, csrcs: &[u32]) {
        self.send.lock().set_csrcs(csrcs);
    }

    pub fn csrcs(&self) -> Vec<u32> {
        self.send.lock().csrcs.clone()
    }

    pub fn set_csrc_status(&self, include: bool) {
        self.send.lock().include_csrcs = include;
    }

    pub fn set_start_timestamp(&self, timestamp: u32, force: bool) {
        self.send.lock().set_start_timestamp(timestamp, force);
    }

    pub fn start_timestamp(&self) -> u32 {
        self.send.lock().start_timestamp
    }

    pub fn timestamp(&self) -> u32 {
        self.send.lock().timestamp
    }

    /// Enabling seeds the start timestamp from the current RTP-time
    /// sample unless it was forced; disabling rotates stream identity
    /// unless SSRC or sequence number were chosen externally.
    pub fn set_sending_status(&self, enabled: bool) {
        if enabled {
            let now_ms = self.clock.now_ms();
            let mut send = self.send.lock();
            let frequency = send.payload_frequency(self.audio_configured);
            let rtp_time = (now_ms as i128 * frequency as i128 / 1000) as u32;
            send.set_start_timestamp(rtp_time, false);
        } else {
            self.send.lock().rotate_on_disable(&*self.ssrc_allocator);
        }
    }

    pub fn set_sending_media(&self, enabled: bool) {
        self.send.lock().sending_media = enabled;
    }

    pub fn sending_media(&self) -> bool {
        self.send.lock().sending_media
    }

    pub fn rtp_state(&self) -> RtpState {
        self.send.lock().rtp_state()
    }

    pub fn set_rtp_state(&self, state: &RtpState) {
        self.send.lock().set_rtp_state(state);
    }

    pub fn rtx_rtp_state(&self) -> RtpState {
        self.send.lock().rtx_rtp_state()
    }

    pub fn set_rtx_rtp_state(&self, state: &RtpState) {
        self.send.lock().set_rtx_rtp_state(state);
    }

    /// Header length of the next packet: fixed part, CSRCs when included
    /// and the registered extension block.
    pub fn rtp_header_length(&self) -> usize {
        let send = self.send.lock();
        let mut length = 12;
        if send.include_csrcs {
            length += send.csrcs.len() * 4;
        }

        length + send.extensions.total_len()
    }

    // ---- statistics ---------------------------------------------------

    pub fn actual_send_bitrate_kbit(&self) -> u16 {
        (self.statistics.lock().bitrate_sent.rate_bps() / 1000) as u16
    }

    pub fn nack_overhead_rate(&self) -> u32 {
        self.statistics.lock().nack_bitrate.rate_bps()
    }

    /// `(average, max)` send-side delay over the last second, or nothing
    /// when no packet left recently enough.
    pub fn send_side_delay(&self) -> Option<(i64, i64)> {
        let now_ms = self.clock.now_ms();
        self.statistics.lock().send_delays.summary(now_ms)
    }

    /// `(media, rtx)` counter snapshot.
    pub fn data_counters(&self) -> (StreamDataCounters, StreamDataCounters) {
        let statistics = self.statistics.lock();
        (statistics.rtp, statistics.rtx)
    }

    pub fn reset_data_counters(&self) {
        let (ssrc, ssrc_rtx) = {
            let send = self.send.lock();
            (send.ssrc, send.ssrc_rtx)
        };

        let callback = {
            let mut statistics = self.statistics.lock();
            statistics.rtp = StreamDataCounters::default();
            statistics.rtx = StreamDataCounters::default();
            statistics.callback.clone()
        };

        if let Some(callback) = callback {
            callback.data_counters_updated(&StreamDataCounters::default(), ssrc);
            callback.data_counters_updated(&StreamDataCounters::default(), ssrc_rtx);
        }
    }

    /// Periodic tick advancing the bitrate estimators and notifying the
    /// bitrate observer.
    pub fn process_bitrate(&self) {
        let now_ms = self.clock.now_ms();
        let ssrc = self.send.lock().ssrc;

        let sent = {
            let mut statistics = self.statistics.lock();
            let sent = statistics.bitrate_sent.process(now_ms);
            statistics.nack_bitrate.process(now_ms);
            sent
        };

        if let (Some(observer), Some(stats)) = (self.bitrate_observer.as_ref(), sent) {
            observer.notify(&stats, ssrc);
        }
    }

    // ---- send paths ---------------------------------------------------

    /// Hot path for a freshly encoded frame: select the payload type,
    /// hand the frame to the packetizer (which emits packets back
    /// through [`SendSink`]) and account the frame.
    ///
    /// A sender with media disabled drops the frame silently; an empty
    /// video frame is a quiet success.
    #[allow(clippy::too_many_arguments)]
    pub fn send_outgoing_data(
        &self,
        frame_type: FrameType,
        payload_type: i8,
        capture_timestamp: u32,
        capture_time_ms: i64,
        payload: &[u8],
        fragmentation: Option<&Fragmentation>,
    ) -> Result<(), Error> {
        let ssrc = {
            let send = self.send.lock();
            if !send.sending_media {
                return Ok(());
            }
            send.ssrc
        };

        let video_codec = self
            .send
            .lock()
            .check_payload_type(payload_type, self.audio_configured)
            .map_err(|err| {
                log::error!("don't send data with unknown payload type");
                err
            })?;

        if self.audio_configured {
            debug_assert!(frame_type.is_audio() || frame_type == FrameType::Empty);
            log::trace!("send audio: type={}", frame_type.as_str());

            let Some(audio) = self.audio.as_ref() else {
                log::warn!("audio frame dropped: no packetizer attached");
                return Ok(());
            };

            audio.send_audio(
                self,
                frame_type,
                payload_type as u8,
                capture_timestamp,
                payload,
                fragmentation,
            )?;
        } else {
            debug_assert!(!frame_type.is_audio());
            log::trace!("send video: type={}", frame_type.as_str());

            if frame_type == FrameType::Empty {
                return Ok(());
            }

            let Some(video) = self.video.as_ref() else {
                log::warn!("video frame dropped: no packetizer attached");
                return Ok(());
            };

            video.send_video(
                self,
                video_codec.unwrap_or(VideoCodec::Generic),
                frame_type,
                payload_type as u8,
                capture_timestamp,
                capture_time_ms,
                payload,
                fragmentation,
            )?;
        }

        let (count, observer) = {
            let mut statistics = self.statistics.lock();
            let count = statistics.frame_counts.entry(frame_type).or_insert(0);
            *count += 1;
            (*count, self.frame_count_observer.clone())
        };

        if let Some(observer) = observer {
            observer.frame_count_updated(frame_type, count, ssrc);
        }

        Ok(())
    }

    /// Pacer callback: a previously submitted packet may leave now.
    ///
    /// Returns `true` when the pacer may keep dispatching; a packet that
    /// fell out of history is not an error.
    pub fn time_to_send_packet(
        &self,
        sequence_number: u16,
        capture_time_ms: i64,
        retransmission: bool,
    ) -> bool {
        let Some((buffer, _)) = self
            .history
            .get_and_mark_sent(sequence_number, 0, retransmission)
        else {
            return true;
        };

        if !retransmission && capture_time_ms > 0 {
            self.update_delay_statistics(capture_time_ms, self.clock.now_ms());
        }

        let rtx_mode = self.send.lock().rtx_mode;
        self.prepare_and_send(
            buffer,
            capture_time_ms,
            retransmission && (rtx_mode & RTX_RETRANSMITTED) != 0,
            retransmission,
        )
    }

    /// Pacer-requested padding: fill `bytes` of budget, preferring
    /// redundant payloads over RTX when that mode is on, then synthetic
    /// padding packets. Returns the bytes actually sent.
    pub fn time_to_send_padding(&self, bytes: usize) -> usize {
        debug_assert!(bytes > 0);
        let (payload_type, timestamp, capture_time_ms, rtx_mode) = {
            let send = self.send.lock();
            if !send.sending_media {
                return 0;
            }

            let payload_type = if (send.rtx_mode & RTX_REDUNDANT_PAYLOADS) != 0 {
                send.payload_type_rtx
            } else {
                send.payload_type
            };

            let mut timestamp = send.timestamp;
            let mut capture_time_ms = send.capture_time_ms;
            if send.last_timestamp_time_ms > 0 {
                // Extrapolate the media clock to now, 90 kHz.
                let since_ms = self.clock.now_ms() - send.last_timestamp_time_ms;
                timestamp = timestamp.wrapping_add((since_ms * 90) as u32);
                capture_time_ms += since_ms;
            }

            (payload_type, timestamp, capture_time_ms, send.rtx_mode)
        };

        let mut bytes_sent = 0;
        if (rtx_mode & RTX_REDUNDANT_PAYLOADS) != 0 {
            bytes_sent = self.send_redundant_payloads(bytes);
        }

        let remaining = bytes.saturating_sub(bytes_sent);
        if remaining > 0 {
            bytes_sent += self.send_pad_data(payload_type, timestamp, capture_time_ms, remaining);
        }

        bytes_sent
    }

    /// NACK feedback from the receiver: resend what history still holds,
    /// bounded by the target bitrate over the last second and by one
    /// RTT's worth of bytes per feedback message.
    pub fn on_received_nack(&self, sequence_numbers: &[u16], avg_rtt_ms: i64) {
        let now_ms = self.clock.now_ms();
        let target_bitrate = self.target_bitrate();
        let mut bytes_resent = 0u32;

        if !self.send.lock().nack.allow(now_ms, target_bitrate) {
            log::info!(
                "NACK bitrate reached, skip sending NACK response, target {}",
                target_bitrate
            );
            return;
        }

        for sequence_number in sequence_numbers {
            match self.resend_packet(*sequence_number, 5 + avg_rtt_ms) {
                // Resent too recently; try the next one in the list.
                Ok(0) => continue,
                Ok(bytes) => bytes_resent += bytes as u32,
                Err(err) => {
                    log::warn!(
                        "failed resending rtp packet {}: {}, discard rest of packets",
                        sequence_number,
                        err
                    );
                    break;
                }
            }

            if target_bitrate != 0 && avg_rtt_ms > 0 {
                // kbit/s * ms = bits, bits / 8 = bytes.
                let target_bytes = (target_bitrate as i64 / 1000 * avg_rtt_ms) / 8;
                if bytes_resent as i64 > target_bytes {
                    break;
                }
            }
        }

        if bytes_resent > 0 {
            self.send.lock().nack.record(bytes_resent, now_ms);
            self.statistics.lock().nack_bitrate.update(bytes_resent as usize);
        }
    }

    /// Resend one stored packet, honoring the minimum resend interval.
    ///
    /// Returns the stored packet length, zero when nothing (eligible)
    /// was found. With a pacer attached the packet is queued at high
    /// priority and leaves through [`RtpSender::time_to_send_packet`].
    pub fn resend_packet(&self, sequence_number: u16, min_resend_ms: i64) -> Result<usize, Error> {
        let Some((buffer, capture_time_ms)) =
            self.history
                .get_and_mark_sent(sequence_number, min_resend_ms, true)
        else {
            return Ok(0);
        };

        let length = buffer.len();
        if let Some(pacer) = self.pacer.as_ref() {
            let Ok(packet) = Packet::try_from(&buffer[..]) else {
                log::warn!("stored packet {} failed to parse", sequence_number);
                return Err(Error::StorageFailure);
            };

            if !pacer.send_packet(
                Priority::High,
                packet.ssrc,
                packet.sequence_number,
                capture_time_ms,
                length - packet.header_len,
                true,
            ) {
                // Queued; the pacer calls back when it is time.
                return Ok(length);
            }
        }

        let rtx_mode = self.send.lock().rtx_mode;
        if self.prepare_and_send(
            buffer,
            capture_time_ms,
            (rtx_mode & RTX_RETRANSMITTED) != 0,
            true,
        ) {
            Ok(length)
        } else {
            Err(Error::TransportFailure)
        }
    }

    // ---- internals ----------------------------------------------------

    /// Shared sending tail: optional RTX rewrap, re-patch both time
    /// extensions to now, transmit, latch `media_has_been_sent`, account.
    fn prepare_and_send(
        &self,
        buffer: BytesMut,
        capture_time_ms: i64,
        send_over_rtx: bool,
        is_retransmit: bool,
    ) -> bool {
        let (csrc_count, header_len) = match Packet::try_from(&buffer[..]) {
            Ok(packet) => (packet.csrc_count, packet.header_len),
            Err(err) => {
                log::warn!("refusing to send malformed packet: {:?}", err);
                return false;
            }
        };

        let mut out = if send_over_rtx {
            self.build_rtx_packet(&buffer, header_len)
        } else {
            buffer
        };

        let now_ms = self.clock.now_ms();
        let diff_ms = now_ms - capture_time_ms;
        {
            let send = self.send.lock();
            send.extensions
                .patch_transmission_offset(&mut out, csrc_count, header_len, diff_ms);
            send.extensions
                .patch_absolute_send_time(&mut out, csrc_count, header_len, now_ms);
        }

        let sent = self.send_packet_to_network(&out);
        if sent {
            self.send.lock().media_has_been_sent = true;
        }

        self.update_rtp_stats(&out, send_over_rtx, is_retransmit);
        sent
    }

    /// RFC 4588 rewrap under the send section: claims the next RTX
    /// sequence number.
    fn build_rtx_packet(&self, packet: &[u8], header_len: usize) -> BytesMut {
        let mut send = self.send.lock();
        let sequence_number = send.sequence_number_rtx;
        send.sequence_number_rtx = send.sequence_number_rtx.wrapping_add(1);

        let payload_type = (send.payload_type_rtx >= 0).then(|| send.payload_type_rtx as u8);
        rtp::rtx::wrap(packet, header_len, payload_type, sequence_number, send.ssrc_rtx)
    }

    /// Fill padding budget with the best fitting stored packets, resent
    /// over RTX.
    fn send_redundant_payloads(&self, bytes_to_send: usize) -> usize {
        let mut bytes_left = bytes_to_send as i64;
        while bytes_left > 0 {
            let Some((buffer, capture_time_ms)) = self.history.get_best_fitting(bytes_left as usize)
            else {
                break;
            };

            let Ok(packet) = Packet::try_from(&buffer[..]) else {
                break;
            };

            let payload_len = buffer.len() - packet.header_len;
            if !self.prepare_and_send(buffer, capture_time_ms, true, false) {
                break;
            }

            bytes_left -= payload_len as i64;
        }

        (bytes_to_send as i64 - bytes_left) as usize
    }

    /// Synthetic padding packets of exactly [`MAX_PADDING_LEN`] payload
    /// bytes; a residual budget below one packet is rounded up.
    fn send_pad_data(
        &self,
        payload_type: i8,
        timestamp: u32,
        capture_time_ms: i64,
        mut bytes: usize,
    ) -> usize {
        let mut bytes_sent = 0;
        while bytes > 0 {
            // Always send full padding packets.
            if bytes < MAX_PADDING_LEN {
                bytes = MAX_PADDING_LEN;
            }

            let (ssrc, sequence_number, over_rtx, extensions, offset, send_time) = {
                let mut send = self.send.lock();
                let (ssrc, sequence_number, over_rtx) = if send.rtx_mode == RTX_OFF {
                    // Without RTX, padding cannot be injected in the
                    // middle of a frame.
                    if !send.last_packet_marker_bit {
                        return bytes_sent;
                    }

                    let sequence_number = send.sequence_number;
                    send.sequence_number = send.sequence_number.wrapping_add(1);
                    (send.ssrc, sequence_number, false)
                } else {
                    // Without abs-send-time a media packet must precede
                    // padding so the receive-side estimator has a
                    // reference.
                    if !send.media_has_been_sent
                        && !send.extensions.is_registered(ExtensionKind::AbsoluteSendTime)
                    {
                        return bytes_sent;
                    }

                    let sequence_number = send.sequence_number_rtx;
                    send.sequence_number_rtx = send.sequence_number_rtx.wrapping_add(1);
                    (send.ssrc_rtx, sequence_number, true)
                };

                (
                    ssrc,
                    sequence_number,
                    over_rtx,
                    send.extensions.clone(),
                    send.transmission_time_offset,
                    send.absolute_send_time,
                )
            };

            let mut buf = BytesMut::with_capacity(IP_PACKET_SIZE);
            let header_len = rtp::build_header(
                &mut buf,
                Header {
                    padding: false,
                    extension: false,
                    marker: false,
                    payload_type: payload_type as u8,
                    sequence_number,
                    timestamp,
                    ssrc,
                    csrcs: Vec::new(),
                },
                &extensions,
                offset,
                send_time,
            );

            let padding_len = MAX_PADDING_LEN.min(bytes);
            header::set_padding_bit(&mut buf);
            {
                let mut body = [0u8; MAX_PADDING_LEN];
                self.padding_rng.lock().fill(&mut body[..padding_len]);
                buf.extend_from_slice(&body[..padding_len]);
            }
            buf[header_len + padding_len - 1] = padding_len as u8;

            let now_ms = self.clock.now_ms();
            if capture_time_ms > 0 {
                extensions.patch_transmission_offset(
                    &mut buf,
                    0,
                    header_len,
                    now_ms - capture_time_ms,
                );
            }
            extensions.patch_absolute_send_time(&mut buf, 0, header_len, now_ms);

            if !self.send_packet_to_network(&buf) {
                break;
            }

            bytes_sent += padding_len;
            bytes -= padding_len;
            self.update_rtp_stats(&buf, over_rtx, false);
        }

        bytes_sent
    }

    /// Rewrite the audio level element of an already built packet.
    ///
    /// The builder writes a placeholder; the real voice activity flag
    /// and level only land here, right before the packet leaves. Returns
    /// `false` (packet untouched) when the extension is unregistered or
    /// the packet does not carry the expected block.
    pub fn update_audio_level(&self, packet: &mut [u8], voiced: bool, dbov: u8) -> bool {
        let (csrc_count, header_len) = match Packet::try_from(&*packet) {
            Ok(parsed) => (parsed.csrc_count, parsed.header_len),
            Err(err) => {
                log::warn!("failed to update audio level: {:?}", err);
                return false;
            }
        };

        self.send
            .lock()
            .extensions
            .patch_audio_level(packet, csrc_count, header_len, voiced, dbov)
    }

    fn send_packet_to_network(&self, packet: &[u8]) -> bool {
        let bytes_sent = self
            .transport
            .as_ref()
            .map(|transport| transport.send_packet(self.id, packet))
            .unwrap_or(-1);

        if bytes_sent <= 0 {
            log::warn!("transport failed to send packet");
            return false;
        }

        true
    }

    fn update_delay_statistics(&self, capture_time_ms: i64, now_ms: i64) {
        let ssrc = self.send.lock().ssrc;
        let summary = {
            let mut statistics = self.statistics.lock();
            statistics.send_delays.record(capture_time_ms, now_ms);
            statistics.send_delays.summary(now_ms)
        };

        if let (Some(observer), Some((avg_ms, max_ms))) =
            (self.send_side_delay_observer.as_ref(), summary)
        {
            observer.send_side_delay_updated(avg_ms, max_ms, ssrc);
        }
    }

    fn update_rtp_stats(&self, buffer: &[u8], is_rtx: bool, is_retransmit: bool) {
        let Ok(packet) = Packet::try_from(buffer) else {
            return;
        };

        // Snapshot the send section first; the lock order forbids taking
        // it under the statistics section.
        let (ssrc, fec) = {
            let send = self.send.lock();
            let ssrc = if is_rtx { send.ssrc_rtx } else { send.ssrc };
            (ssrc, send.fec)
        };

        let is_fec = !self.audio_configured
            && fec.is_some_and(|(red, fec_type)| {
                packet.payload_type == red && packet.payload.first() == Some(&fec_type)
            });

        let (snapshot, callback) = {
            let mut statistics = self.statistics.lock();
            statistics.bitrate_sent.update(buffer.len());

            let counters = if is_rtx {
                &mut statistics.rtx
            } else {
                &mut statistics.rtp
            };

            counters.packets += 1;
            if is_fec {
                counters.fec_packets += 1;
            }

            if is_retransmit {
                counters.retransmitted_packets += 1;
            } else {
                counters.bytes += (buffer.len() - packet.header_len - packet.padding_len) as u64;
                counters.header_bytes += packet.header_len as u64;
                counters.padding_bytes += packet.padding_len as u64;
            }

            let snapshot = *counters;
            (snapshot, statistics.callback.clone())
        };

        if let Some(callback) = callback {
            callback.data_counters_updated(&snapshot, ssrc);
        }
    }
}

impl SendSink for RtpSender {
    /// Write the header for the next media packet: assigns the sequence
    /// number, derives the timestamp from the start timestamp plus the
    /// capture timestamp and records the marker bit for the padding
    /// gate.
    fn build_rtp_header(
        &self,
        buf: &mut BytesMut,
        payload_type: u8,
        marker: bool,
        capture_timestamp: u32,
        capture_time_ms: i64,
    ) -> usize {
        let now_ms = self.clock.now_ms();
        let mut send = self.send.lock();

        send.timestamp = send.start_timestamp.wrapping_add(capture_timestamp);
        send.last_timestamp_time_ms = now_ms;
        send.capture_time_ms = capture_time_ms;
        send.last_packet_marker_bit = marker;

        let sequence_number = send.sequence_number;
        send.sequence_number = send.sequence_number.wrapping_add(1);

        let csrcs = if send.include_csrcs {
            send.csrcs.clone()
        } else {
            Vec::new()
        };

        rtp::build_header(
            buf,
            Header {
                padding: false,
                extension: false,
                marker,
                payload_type,
                sequence_number,
                timestamp: send.timestamp,
                ssrc: send.ssrc,
                csrcs,
            },
            &send.extensions,
            send.transmission_time_offset,
            send.absolute_send_time,
        )
    }

    fn send_to_network(
        &self,
        buffer: &mut [u8],
        payload_len: usize,
        header_len: usize,
        capture_time_ms: i64,
        storage: Storage,
        priority: Priority,
    ) -> Result<usize, Error> {
        let total_len = payload_len + header_len;
        let (ssrc, sequence_number, csrc_count, parsed_header_len) =
            match Packet::try_from(&buffer[..total_len]) {
                Ok(packet) => (
                    packet.ssrc,
                    packet.sequence_number,
                    packet.csrc_count,
                    packet.header_len,
                ),
                Err(err) => {
                    log::warn!("refusing to send malformed packet: {:?}", err);
                    return Err(Error::StorageFailure);
                }
            };

        let now_ms = self.clock.now_ms();
        let max_payload_length = {
            let send = self.send.lock();
            // capture_time_ms of zero or less is considered invalid.
            if capture_time_ms > 0 {
                send.extensions.patch_transmission_offset(
                    buffer,
                    csrc_count,
                    parsed_header_len,
                    now_ms - capture_time_ms,
                );
            }

            send.extensions
                .patch_absolute_send_time(buffer, csrc_count, parsed_header_len, now_ms);
            send.max_payload_length
        };

        self.history
            .put(&buffer[..total_len], max_payload_length, capture_time_ms, storage)?;

        if storage != Storage::DontStore {
            if let Some(pacer) = self.pacer.as_ref() {
                if !pacer.send_packet(
                    priority,
                    ssrc,
                    sequence_number,
                    capture_time_ms,
                    payload_len,
                    false,
                ) {
                    // Deferred; the pacer calls back when it is time.
                    return Ok(0);
                }
            }
        }

        if capture_time_ms > 0 {
            self.update_delay_statistics(capture_time_ms, now_ms);
        }

        if !self.send_packet_to_network(&buffer[..total_len]) {
            return Err(Error::TransportFailure);
        }

        self.send.lock().media_has_been_sent = true;
        self.update_rtp_stats(&buffer[..total_len], false, false);
        Ok(total_len)
    }

    fn update_audio_level(&self, packet: &mut [u8], voiced: bool, dbov: u8) -> bool {
        RtpSender::update_audio_level(self, packet, voiced, dbov)
    }

    /// Payload budget per packet after RTP overhead: header, extension
    /// block and the two RTX octets when retransmission framing is on.
    fn max_data_payload_length(&self) -> usize {
        let rtx_overhead = {
            let send = self.send.lock();
            if send.rtx_mode != RTX_OFF {
                2
            } else {
                0
            }
        };

        self.max_payload_length() - self.rtp_header_length() - rtx_overhead
    }
}

impl Drop for RtpSender {
    fn drop(&mut self) {
        let send = self.send.lock();
        self.ssrc_allocator.release(send.ssrc);
        self.ssrc_allocator.release(send.ssrc_rtx);
    }
}
