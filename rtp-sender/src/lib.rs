//! ## RTP sender engine
//!
//! The stateful sending half of an RTP endpoint: it takes encoded frames
//! plus control signals (NACK feedback, pacing tokens, padding requests)
//! and emits correctly framed RTP packets onto a transport, maintaining
//! the protocol state a WebRTC-grade endpoint needs along the way:
//! sequence numbers and timestamps for the media and retransmission
//! streams, a bounded history of sent packets to answer NACKs from,
//! padding generation, and send-side bitrate and delay accounting.
//!
//! Codec packetization, pacing, the wire socket and the clock live
//! behind the narrow traits defined here; the engine itself never
//! blocks and never holds a lock across a callout into a collaborator.

pub mod history;
pub mod sender;
pub mod ssrc;
pub mod state;
pub mod statistics;

use std::sync::Arc;

use bytes::BytesMut;
use rtp::extension::ExtensionKind;
use thiserror::Error;

pub use sender::RtpSender;
pub use ssrc::SsrcAllocator;
pub use statistics::{BitrateStatistics, StreamDataCounters};

/// An IPv4 MTU-sized bound on everything the sender emits.
pub const IP_PACKET_SIZE: usize = 1500;

/// Padding packets carry exactly this many payload bytes. The RFC 3550
/// ceiling is 255; this stays a multiple of 32 for SRTP block sizes.
pub const MAX_PADDING_LEN: usize = 224;

/// Sliding window for the send-side delay summary.
pub const SEND_DELAY_WINDOW_MS: i64 = 1000;

/// Window the NACK response bitrate is gated over.
pub const NACK_BITRATE_WINDOW_MS: i64 = 1000;

/// Initial sequence numbers are drawn uniformly from `[1, 0x7FFF]`.
pub const MAX_INIT_SEQUENCE: u16 = 0x7FFF;

/// Retransmission is disabled.
pub const RTX_OFF: u8 = 0;
/// NACKed packets are resent on the RTX stream.
pub const RTX_RETRANSMITTED: u8 = 1;
/// Padding budget is filled with stored payloads resent over RTX before
/// synthetic padding is generated.
pub const RTX_REDUNDANT_PAYLOADS: u8 = 2;

#[derive(Debug, Error)]
pub enum Error {
    /// Payload type negative or not registered when selected.
    #[error("invalid payload type: {0}")]
    InvalidPayloadType(i8),
    /// Registration conflicts with an incompatible existing descriptor.
    #[error("payload type {0} already registered with a different format")]
    UnregisteredPayload(i8),
    /// A header extension kind re-registered under a different ID.
    #[error("extension {0:?} already registered under a different id")]
    ExtensionConflict(ExtensionKind),
    /// A bit-field value does not fit its wire width, or a length bound
    /// was violated.
    #[error("value out of range")]
    OutOfRange,
    /// The packet history rejected an insert.
    #[error("packet history rejected the packet")]
    StorageFailure,
    /// The transport wrote zero or fewer bytes.
    #[error("transport failed to send packet")]
    TransportFailure,
}

/// Frame classification as handed in by the encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Empty,
    AudioSpeech,
    AudioCn,
    VideoKey,
    VideoDelta,
}

impl FrameType {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::Empty => "empty",
            FrameType::AudioSpeech => "audio_speech",
            FrameType::AudioCn => "audio_cn",
            FrameType::VideoKey => "video_key",
            FrameType::VideoDelta => "video_delta",
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(self, FrameType::AudioSpeech | FrameType::AudioCn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Generic,
    Vp8,
    H264,
}

/// Queueing priority a packet is submitted to the pacer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// What the packet history should do with an outgoing packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Never stored; the packet cannot be paced or retransmitted later.
    DontStore,
    /// Stored for the pacer, but refused when asked for as a
    /// retransmission.
    DontRetransmit,
    /// Stored and available to NACK responses.
    AllowRetransmission,
}

/// Registered payload descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub name: String,
    pub format: PayloadFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadFormat {
    Audio {
        frequency: u32,
        channels: u8,
        rate: u32,
    },
    Video {
        codec: VideoCodec,
        max_bitrate: u32,
    },
}

/// Fragmentation layout produced by an encoder, passed through to the
/// packetizer untouched.
#[derive(Debug, Clone, Default)]
pub struct Fragmentation {
    pub offsets: Vec<usize>,
    pub lengths: Vec<usize>,
}

/// Snapshot of one stream's protocol state, used to persist sequence
/// and timestamp continuity across sender reconfiguration.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtpState {
    pub sequence_number: u16,
    pub start_timestamp: u32,
    pub timestamp: u32,
    pub capture_time_ms: i64,
    pub last_timestamp_time_ms: i64,
    pub media_has_been_sent: bool,
}

/// Millisecond monotonic time source.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Opaque packet sink.
///
/// A return value of zero or less means the packet was not sent; the
/// engine logs and surfaces the failure without retrying.
pub trait Transport: Send + Sync {
    fn send_packet(&self, channel: i32, packet: &[u8]) -> isize;
}

/// External egress scheduler.
///
/// When `send_packet` returns `false` the pacer has queued the packet;
/// it is expected to call back into
/// [`RtpSender::time_to_send_packet`] (and
/// [`RtpSender::time_to_send_padding`] for padding budget) when the
/// packet may leave.
pub trait Pacer: Send + Sync {
    fn send_packet(
        &self,
        priority: Priority,
        ssrc: u32,
        sequence_number: u16,
        capture_time_ms: i64,
        payload_len: usize,
        retransmission: bool,
    ) -> bool;
}

/// The narrow surface packetizers emit through; implemented by
/// [`RtpSender`]. Packetizers receive it per call, which keeps the
/// packetizer/sender dependency a plain call cycle instead of an
/// ownership cycle.
pub trait SendSink {
    /// Write the RTP header for the next packet on the media stream,
    /// assigning the sequence number and timestamp. Returns the header
    /// length.
    fn build_rtp_header(
        &self,
        buf: &mut BytesMut,
        payload_type: u8,
        marker: bool,
        capture_timestamp: u32,
        capture_time_ms: i64,
    ) -> usize;

    /// Emit one finished packet: patch the time extensions, store it per
    /// `storage`, hand it to the pacer when one is attached, otherwise
    /// transmit. Returns the bytes handed to the transport; zero means
    /// the pacer deferred the packet.
    fn send_to_network(
        &self,
        buffer: &mut [u8],
        payload_len: usize,
        header_len: usize,
        capture_time_ms: i64,
        storage: Storage,
        priority: Priority,
    ) -> Result<usize, Error>;

    /// Rewrite the audio level element of a built packet with the real
    /// voice flag and level; the header builder only writes a
    /// placeholder. A no-op returning `false` when the extension is
    /// unregistered.
    fn update_audio_level(&self, packet: &mut [u8], voiced: bool, dbov: u8) -> bool;

    /// Budget available to one packet's payload after header, extension
    /// and RTX overhead.
    fn max_data_payload_length(&self) -> usize;
}

pub trait AudioPacketizer: Send + Sync {
    fn send_audio(
        &self,
        sink: &dyn SendSink,
        frame_type: FrameType,
        payload_type: u8,
        capture_timestamp: u32,
        payload: &[u8],
        fragmentation: Option<&Fragmentation>,
    ) -> Result<(), Error>;
}

pub trait VideoPacketizer: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn send_video(
        &self,
        sink: &dyn SendSink,
        codec: VideoCodec,
        frame_type: FrameType,
        payload_type: u8,
        capture_timestamp: u32,
        capture_time_ms: i64,
        payload: &[u8],
        fragmentation: Option<&Fragmentation>,
    ) -> Result<(), Error>;
}

pub trait BitrateObserver: Send + Sync {
    fn notify(&self, stats: &BitrateStatistics, ssrc: u32);
}

pub trait FrameCountObserver: Send + Sync {
    fn frame_count_updated(&self, frame_type: FrameType, count: u32, ssrc: u32);
}

pub trait SendSideDelayObserver: Send + Sync {
    fn send_side_delay_updated(&self, avg_ms: i64, max_ms: i64, ssrc: u32);
}

pub trait StreamDataCountersCallback: Send + Sync {
    fn data_counters_updated(&self, counters: &StreamDataCounters, ssrc: u32);
}

/// Everything a sender is wired up with at construction.
pub struct Options {
    /// Channel identifier handed to the transport with every packet.
    pub id: i32,
    /// Audio sender when true, video sender otherwise.
    pub audio: bool,
    pub clock: Arc<dyn Clock>,
    pub transport: Option<Arc<dyn Transport>>,
    pub pacer: Option<Arc<dyn Pacer>>,
    pub audio_packetizer: Option<Arc<dyn AudioPacketizer>>,
    pub video_packetizer: Option<Arc<dyn VideoPacketizer>>,
    /// Source of process-unique SSRCs; [`ssrc::global`] outside of
    /// tests.
    pub ssrc_allocator: Arc<dyn SsrcAllocator>,
    pub bitrate_observer: Option<Arc<dyn BitrateObserver>>,
    pub frame_count_observer: Option<Arc<dyn FrameCountObserver>>,
    pub send_side_delay_observer: Option<Arc<dyn SendSideDelayObserver>>,
}
