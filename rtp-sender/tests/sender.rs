use std::convert::TryFrom;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use bytes::BytesMut;
use rtp::extension::ExtensionKind;
use rtp::header::Packet;
use rtp_sender::{
    Clock, Error, Fragmentation, FrameType, Options, Pacer, Payload, PayloadFormat, Priority,
    RtpSender, SendSink, SsrcAllocator, Storage, Transport, VideoCodec, VideoPacketizer,
    MAX_PADDING_LEN, RTX_RETRANSMITTED,
};

#[derive(Default)]
struct FakeClock(AtomicI64);

impl FakeClock {
    fn set(&self, now_ms: i64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }

    fn advance(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeTransport {
    packets: Mutex<Vec<Vec<u8>>>,
    fail: AtomicBool,
}

impl FakeTransport {
    fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.packets.lock().unwrap())
    }

    fn count(&self) -> usize {
        self.packets.lock().unwrap().len()
    }
}

impl Transport for FakeTransport {
    fn send_packet(&self, _channel: i32, packet: &[u8]) -> isize {
        if self.fail.load(Ordering::SeqCst) {
            return -1;
        }

        self.packets.lock().unwrap().push(packet.to_vec());
        packet.len() as isize
    }
}

/// Hands out 1000, 1001, ... so tests know both stream identifiers.
struct FakeAllocator(AtomicU32);

impl Default for FakeAllocator {
    fn default() -> Self {
        Self(AtomicU32::new(1000))
    }
}

impl SsrcAllocator for FakeAllocator {
    fn allocate(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    fn register(&self, _ssrc: u32) {}

    fn release(&self, _ssrc: u32) {}
}

#[derive(Default)]
struct FakePacer {
    accept: AtomicBool,
    submitted: Mutex<Vec<(u32, u16, usize, bool)>>,
}

impl Pacer for FakePacer {
    fn send_packet(
        &self,
        _priority: Priority,
        ssrc: u32,
        sequence_number: u16,
        _capture_time_ms: i64,
        payload_len: usize,
        retransmission: bool,
    ) -> bool {
        self.submitted
            .lock()
            .unwrap()
            .push((ssrc, sequence_number, payload_len, retransmission));
        self.accept.load(Ordering::SeqCst)
    }
}

/// One packet per frame, marker set, in the configured storage mode.
struct WholeFramePacketizer {
    storage: Storage,
}

impl VideoPacketizer for WholeFramePacketizer {
    fn send_video(
        &self,
        sink: &dyn SendSink,
        _codec: VideoCodec,
        _frame_type: FrameType,
        payload_type: u8,
        capture_timestamp: u32,
        capture_time_ms: i64,
        payload: &[u8],
        _fragmentation: Option<&Fragmentation>,
    ) -> Result<(), Error> {
        let mut buf = BytesMut::with_capacity(1500);
        let header_len =
            sink.build_rtp_header(&mut buf, payload_type, true, capture_timestamp, capture_time_ms);
        buf.extend_from_slice(payload);

        sink.send_to_network(
            &mut buf,
            payload.len(),
            header_len,
            capture_time_ms,
            self.storage,
            Priority::Normal,
        )?;
        Ok(())
    }
}

struct Fixture {
    clock: Arc<FakeClock>,
    transport: Arc<FakeTransport>,
    sender: RtpSender,
}

fn video_fixture(storage: Storage, pacer: Option<Arc<FakePacer>>) -> Fixture {
    let clock = Arc::new(FakeClock::default());
    let transport = Arc::new(FakeTransport::default());

    let sender = RtpSender::new(Options {
        id: 1,
        audio: false,
        clock: clock.clone(),
        transport: Some(transport.clone()),
        pacer: pacer.map(|pacer| pacer as Arc<dyn Pacer>),
        audio_packetizer: None,
        video_packetizer: Some(Arc::new(WholeFramePacketizer { storage })),
        ssrc_allocator: Arc::new(FakeAllocator::default()),
        bitrate_observer: None,
        frame_count_observer: None,
        send_side_delay_observer: None,
    });

    sender
        .register_payload(
            100,
            Payload {
                name: "vp8".to_string(),
                format: PayloadFormat::Video {
                    codec: VideoCodec::Vp8,
                    max_bitrate: 0,
                },
            },
        )
        .unwrap();

    Fixture {
        clock,
        transport,
        sender,
    }
}

fn send_frame(fixture: &Fixture, capture_timestamp: u32, capture_time_ms: i64, len: usize) {
    fixture
        .sender
        .send_outgoing_data(
            FrameType::VideoKey,
            100,
            capture_timestamp,
            capture_time_ms,
            &vec![0xA5; len],
            None,
        )
        .unwrap();
}

fn read_i24(bytes: &[u8]) -> i32 {
    let raw = ((bytes[0] as i32) << 16) | ((bytes[1] as i32) << 8) | bytes[2] as i32;
    (raw << 8) >> 8
}

fn read_u24(bytes: &[u8]) -> u32 {
    ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32
}

#[test]
fn basic_video_send() -> Result<()> {
    let fixture = video_fixture(Storage::AllowRetransmission, None);
    fixture.clock.set(1005);
    fixture.sender.set_store_packets_status(true, 10);
    fixture.sender.set_ssrc(0xDEADBEEF);
    fixture.sender.set_start_timestamp(10_000, true);
    fixture
        .sender
        .register_extension(ExtensionKind::TransmissionTimeOffset, 3)?;

    let sequence_number = fixture.sender.sequence_number();
    send_frame(&fixture, 90_000, 1000, 400);

    let packets = fixture.transport.take();
    assert_eq!(packets.len(), 1);

    let packet = Packet::try_from(&packets[0][..])?;
    assert_eq!(packet.payload_type, 100);
    assert!(packet.marker);
    assert_eq!(packet.sequence_number, sequence_number);
    assert_eq!(packet.timestamp, 100_000);
    assert_eq!(packet.ssrc, 0xDEADBEEF);
    assert_eq!(packet.payload.len(), 400);

    // Transmission offset element: 5 ms late, in 90 kHz units.
    assert_eq!(&packets[0][12..14], &[0xBE, 0xDE]);
    assert_eq!(packets[0][16], (3 << 4) | 2);
    assert_eq!(read_i24(&packets[0][17..20]), 450);

    Ok(())
}

#[test]
fn sequence_numbers_are_contiguous_across_the_wrap() -> Result<()> {
    let fixture = video_fixture(Storage::DontStore, None);
    fixture.clock.set(1000);
    fixture.sender.set_sequence_number(65_534);

    for _ in 0..5 {
        send_frame(&fixture, 0, 1000, 100);
    }

    let sequence_numbers: Vec<u16> = fixture
        .transport
        .take()
        .iter()
        .map(|packet| Packet::try_from(&packet[..]).unwrap().sequence_number)
        .collect();
    assert_eq!(sequence_numbers, vec![65_534, 65_535, 0, 1, 2]);

    Ok(())
}

#[test]
fn absolute_send_time_is_patched_on_send() -> Result<()> {
    let fixture = video_fixture(Storage::DontStore, None);
    fixture.clock.set(1500);
    fixture
        .sender
        .register_extension(ExtensionKind::AbsoluteSendTime, 2)?;

    send_frame(&fixture, 0, 1000, 100);

    let packets = fixture.transport.take();
    assert_eq!(packets[0][16], (2 << 4) | 2);
    assert_eq!(read_u24(&packets[0][17..20]), 393_216);

    Ok(())
}

#[test]
fn nack_resends_over_rtx() -> Result<()> {
    let fixture = video_fixture(Storage::AllowRetransmission, None);
    fixture.clock.set(1000);
    fixture.sender.set_store_packets_status(true, 20);
    fixture.sender.set_sequence_number(1000);
    fixture.sender.set_rtx_mode(RTX_RETRANSMITTED);
    fixture.sender.set_rtx_payload_type(97);

    let rtx_ssrc = fixture.sender.rtx_ssrc();
    for i in 0..10 {
        send_frame(&fixture, i * 3000, 1000, 100);
    }

    let originals = fixture.transport.take();
    assert_eq!(originals.len(), 10);

    let rtx_sequence_start = fixture.sender.rtx_rtp_state().sequence_number;
    fixture.clock.advance(30);
    fixture.sender.on_received_nack(&[1003, 1005], 20);

    let resent = fixture.transport.take();
    assert_eq!(resent.len(), 2);

    for (i, (packet, lost)) in resent.iter().zip([1003u16, 1005]).enumerate() {
        let parsed = Packet::try_from(&packet[..])?;
        assert_eq!(parsed.ssrc, rtx_ssrc);
        assert_eq!(parsed.payload_type, 97);
        assert_eq!(
            parsed.sequence_number,
            rtx_sequence_start.wrapping_add(i as u16)
        );

        // OSN in front of the original payload.
        let osn = u16::from_be_bytes([parsed.payload[0], parsed.payload[1]]);
        assert_eq!(osn, lost);

        let original = Packet::try_from(&originals[(lost - 1000) as usize][..])?;
        assert_eq!(&parsed.payload[2..], original.payload);
    }

    Ok(())
}

#[test]
fn nack_respects_the_min_resend_interval() -> Result<()> {
    let fixture = video_fixture(Storage::AllowRetransmission, None);
    fixture.clock.set(1000);
    fixture.sender.set_store_packets_status(true, 20);
    fixture.sender.set_sequence_number(1000);

    send_frame(&fixture, 0, 1000, 100);
    fixture.transport.take();

    fixture.sender.on_received_nack(&[1000], 20);
    assert_eq!(fixture.transport.count(), 1);

    // A second request right away is inside 5 + rtt ms.
    fixture.sender.on_received_nack(&[1000], 20);
    assert_eq!(fixture.transport.count(), 1);

    fixture.clock.advance(30);
    fixture.sender.on_received_nack(&[1000], 20);
    assert_eq!(fixture.transport.count(), 2);

    Ok(())
}

#[test]
fn nack_bitrate_gate_closes_and_slides() -> Result<()> {
    let fixture = video_fixture(Storage::AllowRetransmission, None);
    fixture.clock.set(1000);
    fixture.sender.set_store_packets_status(true, 30);
    fixture.sender.set_sequence_number(1000);
    fixture.sender.set_target_bitrate(100_000);

    for i in 0..25 {
        send_frame(&fixture, i * 3000, 1000, 1000);
    }
    fixture.transport.take();

    // 20 kB resent: past the 100 kbit the window allows.
    let lost: Vec<u16> = (1000..1020).collect();
    fixture.sender.on_received_nack(&lost, 0);
    assert_eq!(fixture.transport.take().len(), 20);

    fixture.clock.advance(500);
    fixture.sender.on_received_nack(&[1020], 0);
    assert_eq!(fixture.transport.count(), 0);

    // The window slides past the burst.
    fixture.clock.advance(600);
    fixture.sender.on_received_nack(&[1020], 0);
    assert_eq!(fixture.transport.count(), 1);

    Ok(())
}

#[test]
fn nack_list_is_bounded_by_one_rtt_of_bytes() -> Result<()> {
    let fixture = video_fixture(Storage::AllowRetransmission, None);
    fixture.clock.set(1000);
    fixture.sender.set_store_packets_status(true, 30);
    fixture.sender.set_sequence_number(1000);
    fixture.sender.set_target_bitrate(100_000);

    for i in 0..5 {
        send_frame(&fixture, i * 3000, 1000, 1000);
    }
    fixture.transport.take();

    // 100 kbit/s * 20 ms / 8 = 250 bytes: one kilobyte packet overshoots
    // the allowance, so iteration stops after the first resend.
    let lost: Vec<u16> = (1000..1005).collect();
    fixture.sender.on_received_nack(&lost, 20);
    assert_eq!(fixture.transport.take().len(), 1);

    Ok(())
}

#[test]
fn padding_after_a_marker_frame_uses_the_media_stream() -> Result<()> {
    let fixture = video_fixture(Storage::DontStore, None);
    fixture.clock.set(1000);

    send_frame(&fixture, 0, 1000, 100);
    fixture.transport.take();
    let sequence_start = fixture.sender.sequence_number();

    let sent = fixture.sender.time_to_send_padding(500);
    assert_eq!(sent, 672);

    let packets = fixture.transport.take();
    assert_eq!(packets.len(), 3);

    for (i, packet) in packets.iter().enumerate() {
        let parsed = Packet::try_from(&packet[..])?;
        assert_eq!(parsed.ssrc, fixture.sender.ssrc());
        assert_eq!(
            parsed.sequence_number,
            sequence_start.wrapping_add(i as u16)
        );
        assert!(!parsed.marker);
        assert_eq!(packet[0] & 0x20, 0x20);
        assert_eq!(parsed.padding_len, MAX_PADDING_LEN);
        assert_eq!(*packet.last().unwrap() as usize, MAX_PADDING_LEN);
        assert!(parsed.payload.is_empty());
    }

    Ok(())
}

#[test]
fn padding_without_rtx_needs_a_finished_frame() {
    let fixture = video_fixture(Storage::DontStore, None);
    fixture.clock.set(1000);

    // Nothing sent yet: the marker gate holds everything back.
    assert_eq!(fixture.sender.time_to_send_padding(1000), 0);
    assert_eq!(fixture.transport.count(), 0);
}

#[test]
fn rtx_padding_needs_media_or_abs_send_time() -> Result<()> {
    let fixture = video_fixture(Storage::DontStore, None);
    fixture.clock.set(1000);
    fixture.sender.set_rtx_mode(RTX_RETRANSMITTED);

    assert_eq!(fixture.sender.time_to_send_padding(100), 0);

    // Registering abs-send-time opens the gate; padding rides RTX.
    fixture
        .sender
        .register_extension(ExtensionKind::AbsoluteSendTime, 2)?;
    assert_eq!(fixture.sender.time_to_send_padding(100), MAX_PADDING_LEN);

    let packets = fixture.transport.take();
    let parsed = Packet::try_from(&packets[0][..])?;
    assert_eq!(parsed.ssrc, fixture.sender.rtx_ssrc());

    Ok(())
}

#[test]
fn pacer_defers_and_later_releases_a_packet() -> Result<()> {
    let pacer = Arc::new(FakePacer::default());
    let fixture = video_fixture(Storage::AllowRetransmission, Some(pacer.clone()));
    fixture.clock.set(1000);
    fixture.sender.set_store_packets_status(true, 10);

    let sequence_number = fixture.sender.sequence_number();
    send_frame(&fixture, 0, 1000, 200);

    // Deferred: nothing on the wire, one submission to the pacer.
    assert_eq!(fixture.transport.count(), 0);
    let submitted = pacer.submitted.lock().unwrap().clone();
    assert_eq!(submitted, vec![(fixture.sender.ssrc(), sequence_number, 200, false)]);

    fixture.clock.advance(15);
    assert!(fixture
        .sender
        .time_to_send_packet(sequence_number, 1000, false));

    let packets = fixture.transport.take();
    assert_eq!(packets.len(), 1);
    assert_eq!(
        Packet::try_from(&packets[0][..])?.sequence_number,
        sequence_number
    );

    // An unknown sequence number lets the pacer keep going.
    assert!(fixture.sender.time_to_send_packet(4711, 1000, false));
    assert_eq!(fixture.transport.count(), 0);

    Ok(())
}

#[test]
fn unstored_packets_cannot_be_retransmitted() {
    let fixture = video_fixture(Storage::DontStore, None);
    fixture.clock.set(1000);
    fixture.sender.set_store_packets_status(true, 10);
    fixture.sender.set_sequence_number(1000);

    send_frame(&fixture, 0, 1000, 100);
    fixture.transport.take();

    fixture.sender.on_received_nack(&[1000], 0);
    assert_eq!(fixture.transport.count(), 0);
}

#[test]
fn send_delay_summary_tracks_recent_sends() {
    let fixture = video_fixture(Storage::DontStore, None);
    fixture.clock.set(1005);
    assert!(fixture.sender.send_side_delay().is_none());

    send_frame(&fixture, 0, 1000, 100);
    assert_eq!(fixture.sender.send_side_delay(), Some((5, 5)));

    fixture.clock.advance(2000);
    assert!(fixture.sender.send_side_delay().is_none());
}

#[test]
fn sender_counts_media_and_padding_separately() -> Result<()> {
    let fixture = video_fixture(Storage::DontStore, None);
    fixture.clock.set(1000);

    send_frame(&fixture, 0, 1000, 100);
    fixture.sender.time_to_send_padding(100);

    let (media, rtx) = fixture.sender.data_counters();
    assert_eq!(media.packets, 2);
    assert_eq!(media.bytes, 100);
    assert_eq!(media.padding_bytes, MAX_PADDING_LEN as u64);
    assert_eq!(media.retransmitted_packets, 0);
    assert_eq!(rtx.packets, 0);

    fixture.sender.reset_data_counters();
    let (media, _) = fixture.sender.data_counters();
    assert_eq!(media.packets, 0);

    Ok(())
}

#[test]
fn retransmissions_land_in_the_rtx_counters() -> Result<()> {
    let fixture = video_fixture(Storage::AllowRetransmission, None);
    fixture.clock.set(1000);
    fixture.sender.set_store_packets_status(true, 10);
    fixture.sender.set_sequence_number(1000);
    fixture.sender.set_rtx_mode(RTX_RETRANSMITTED);

    send_frame(&fixture, 0, 1000, 100);
    fixture.sender.on_received_nack(&[1000], 0);

    let (media, rtx) = fixture.sender.data_counters();
    assert_eq!(media.packets, 1);
    assert_eq!(rtx.packets, 1);
    assert_eq!(rtx.retransmitted_packets, 1);
    assert_eq!(rtx.bytes, 0);

    Ok(())
}

#[test]
fn disabled_media_drops_frames_silently() {
    let fixture = video_fixture(Storage::DontStore, None);
    fixture.clock.set(1000);
    fixture.sender.set_sending_media(false);

    send_frame(&fixture, 0, 1000, 100);
    assert_eq!(fixture.transport.count(), 0);
}

#[test]
fn unknown_payload_type_is_an_error() {
    let fixture = video_fixture(Storage::DontStore, None);
    fixture.clock.set(1000);

    let result = fixture.sender.send_outgoing_data(
        FrameType::VideoKey,
        101,
        0,
        1000,
        &[0u8; 10],
        None,
    );
    assert!(matches!(result, Err(Error::InvalidPayloadType(101))));
}

#[test]
fn empty_video_frame_is_a_quiet_success() {
    let fixture = video_fixture(Storage::DontStore, None);
    fixture.clock.set(1000);

    fixture
        .sender
        .send_outgoing_data(FrameType::Empty, 100, 0, 1000, &[], None)
        .unwrap();
    assert_eq!(fixture.transport.count(), 0);
}

#[test]
fn rtp_state_round_trips() {
    let fixture = video_fixture(Storage::DontStore, None);

    let state = rtp_sender::RtpState {
        sequence_number: 4242,
        start_timestamp: 90_000,
        timestamp: 93_000,
        capture_time_ms: 1000,
        last_timestamp_time_ms: 1005,
        media_has_been_sent: true,
    };

    fixture.sender.set_rtp_state(&state);
    let restored = fixture.sender.rtp_state();
    assert_eq!(restored.sequence_number, 4242);
    assert_eq!(restored.start_timestamp, 90_000);
    assert_eq!(restored.timestamp, 93_000);
    assert_eq!(restored.capture_time_ms, 1000);
    assert_eq!(restored.media_has_been_sent, true);

    // A forced state pins the start timestamp against later seeding.
    fixture.sender.set_start_timestamp(7, false);
    assert_eq!(fixture.sender.start_timestamp(), 90_000);
}

#[test]
fn extension_reregistration_under_a_new_id_is_a_conflict() {
    let fixture = video_fixture(Storage::DontStore, None);

    fixture
        .sender
        .register_extension(ExtensionKind::AbsoluteSendTime, 2)
        .unwrap();
    fixture
        .sender
        .register_extension(ExtensionKind::AbsoluteSendTime, 2)
        .unwrap();

    assert!(matches!(
        fixture
            .sender
            .register_extension(ExtensionKind::AbsoluteSendTime, 3),
        Err(Error::ExtensionConflict(ExtensionKind::AbsoluteSendTime))
    ));
    assert!(matches!(
        fixture.sender.register_extension(ExtensionKind::AudioLevel, 15),
        Err(Error::OutOfRange)
    ));
}

#[test]
fn transport_failure_surfaces_to_the_caller() {
    let fixture = video_fixture(Storage::DontStore, None);
    fixture.clock.set(1000);
    fixture.transport.fail.store(true, Ordering::SeqCst);

    let result = fixture.sender.send_outgoing_data(
        FrameType::VideoKey,
        100,
        0,
        1000,
        &[0u8; 10],
        None,
    );
    assert!(matches!(result, Err(Error::TransportFailure)));
}
