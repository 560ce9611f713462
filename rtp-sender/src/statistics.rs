use std::collections::BTreeMap;
use std::ops::Bound;

use crate::{NACK_BITRATE_WINDOW_MS, SEND_DELAY_WINDOW_MS};

/// Slots in the NACK byte-count ring, newest first.
pub(crate) const NACK_BYTE_COUNT_SLOTS: usize = 60;

/// Per-stream octet and packet counters; media and RTX streams each get
/// their own set.
#[derive(Debug, Default, Clone, Copy)]
pub struct StreamDataCounters {
    /// Payload octets, headers and padding excluded.
    pub bytes: u64,
    pub header_bytes: u64,
    pub padding_bytes: u64,
    pub packets: u32,
    pub retransmitted_packets: u32,
    pub fec_packets: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct BitrateStatistics {
    pub bitrate_bps: u32,
    pub packet_rate: u32,
    pub timestamp_ms: i64,
}

/// Rolling bitrate estimate fed by `update` and advanced by a periodic
/// `process` tick.
///
/// Ticks closer than 100 ms apart are ignored; a gap above 10 s resets
/// the window instead of producing a nonsense average.
#[derive(Debug, Default)]
pub(crate) struct BitrateTracker {
    accumulated_bytes: u64,
    accumulated_packets: u32,
    last_process_ms: i64,
    rate_bps: u32,
    packet_rate: u32,
}

impl BitrateTracker {
    pub fn update(&mut self, bytes: usize) {
        self.accumulated_bytes += bytes as u64;
        self.accumulated_packets += 1;
    }

    pub fn process(&mut self, now_ms: i64) -> Option<BitrateStatistics> {
        if self.last_process_ms == 0 {
            self.last_process_ms = now_ms;
            return None;
        }

        let diff_ms = now_ms - self.last_process_ms;
        if diff_ms < 100 {
            return None;
        }

        if diff_ms > 10_000 {
            self.accumulated_bytes = 0;
            self.accumulated_packets = 0;
            self.rate_bps = 0;
            self.packet_rate = 0;
            self.last_process_ms = now_ms;
            return None;
        }

        self.rate_bps = (self.accumulated_bytes as i64 * 8 * 1000 / diff_ms) as u32;
        self.packet_rate = (self.accumulated_packets as i64 * 1000 / diff_ms) as u32;
        self.accumulated_bytes = 0;
        self.accumulated_packets = 0;
        self.last_process_ms = now_ms;

        Some(BitrateStatistics {
            bitrate_bps: self.rate_bps,
            packet_rate: self.packet_rate,
            timestamp_ms: now_ms,
        })
    }

    pub fn rate_bps(&self) -> u32 {
        self.rate_bps
    }
}

/// Send-side delay samples over the last second.
#[derive(Debug, Default)]
pub(crate) struct SendDelayWindow {
    delays: BTreeMap<i64, i64>,
}

impl SendDelayWindow {
    pub fn record(&mut self, capture_time_ms: i64, now_ms: i64) {
        self.delays.insert(now_ms, now_ms - capture_time_ms);
        let kept = self.delays.split_off(&(now_ms - SEND_DELAY_WINDOW_MS));
        self.delays = kept;
    }

    /// Average (rounded) and maximum delay over `(now - window, now]`,
    /// or nothing when no sample is that recent.
    pub fn summary(&self, now_ms: i64) -> Option<(i64, i64)> {
        let mut sum = 0i64;
        let mut max = 0i64;
        let mut count = 0i64;
        let window = (
            Bound::Excluded(now_ms - SEND_DELAY_WINDOW_MS),
            Bound::Unbounded,
        );

        for (_, delay) in self.delays.range(window) {
            sum += delay;
            max = max.max(*delay);
            count += 1;
        }

        if count == 0 {
            return None;
        }

        Some(((sum + count / 2) / count, max))
    }
}

/// Byte counts of recent NACK responses, newest slot first.
///
/// Gates further retransmission once the bytes resent within the last
/// second exceed the target bitrate.
#[derive(Debug)]
pub(crate) struct NackWindow {
    bytes: [u32; NACK_BYTE_COUNT_SLOTS],
    times: [i64; NACK_BYTE_COUNT_SLOTS],
}

impl Default for NackWindow {
    fn default() -> Self {
        Self {
            bytes: [0; NACK_BYTE_COUNT_SLOTS],
            times: [0; NACK_BYTE_COUNT_SLOTS],
        }
    }
}

impl NackWindow {
    /// May another NACK response go out right now?
    ///
    /// Open when no target bitrate is set. When every slot is younger
    /// than the window, the oldest slot's age replaces the nominal
    /// window length so a burst cannot launder itself through slot
    /// exhaustion.
    pub fn allow(&self, now_ms: i64, target_bitrate_bps: u32) -> bool {
        if target_bitrate_bps == 0 {
            return true;
        }

        let mut byte_count = 0i64;
        let mut num = 0;
        while num < NACK_BYTE_COUNT_SLOTS {
            if now_ms - self.times[num] > NACK_BITRATE_WINDOW_MS {
                break;
            }
            byte_count += self.bytes[num] as i64;
            num += 1;
        }

        let mut interval_ms = NACK_BITRATE_WINDOW_MS;
        if num == NACK_BYTE_COUNT_SLOTS && self.times[NACK_BYTE_COUNT_SLOTS - 1] <= now_ms {
            interval_ms = now_ms - self.times[NACK_BYTE_COUNT_SLOTS - 1];
        }

        byte_count * 8 < (target_bitrate_bps as i64 / 1000) * interval_ms
    }

    /// Record the byte count of one NACK response; the oldest slot falls
    /// off the end.
    pub fn record(&mut self, bytes: u32, now_ms: i64) {
        if bytes == 0 {
            return;
        }

        if self.times[0] != 0 {
            for i in (0..NACK_BYTE_COUNT_SLOTS - 1).rev() {
                self.bytes[i + 1] = self.bytes[i];
                self.times[i + 1] = self.times[i];
            }
        }

        self.bytes[0] = bytes;
        self.times[0] = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_summary_needs_a_recent_sample() {
        let mut window = SendDelayWindow::default();
        assert!(window.summary(5000).is_none());

        window.record(900, 1000);
        assert_eq!(window.summary(1000), Some((100, 100)));

        // The sample ages out of the window.
        assert!(window.summary(2100).is_none());
    }

    #[test]
    fn delay_summary_rounds_the_average() {
        let mut window = SendDelayWindow::default();
        window.record(990, 1000);
        window.record(989, 1010);
        window.record(987, 1020);

        // Delays 10, 21, 33: sum 64, rounded average 21, max 33.
        assert_eq!(window.summary(1020), Some((21, 33)));
    }

    #[test]
    fn nack_window_open_without_target() {
        let window = NackWindow::default();
        assert!(window.allow(1000, 0));
    }

    #[test]
    fn nack_window_closes_at_the_target() {
        let mut window = NackWindow::default();
        // 100 kbps target, 1 s window: 100 kbit of headroom.
        window.record(20_000, 1000);
        assert!(!window.allow(1500, 100_000));

        // The burst ages out after the window slides.
        assert!(window.allow(2500, 100_000));
    }

    #[test]
    fn bitrate_tracker_estimates_over_the_tick_interval() {
        let mut tracker = BitrateTracker::default();
        assert!(tracker.process(1000).is_none());

        for _ in 0..10 {
            tracker.update(1000);
        }

        let stats = tracker.process(2000).unwrap();
        assert_eq!(stats.bitrate_bps, 80_000);
        assert_eq!(stats.packet_rate, 10);
        assert_eq!(tracker.rate_bps(), 80_000);
    }
}
