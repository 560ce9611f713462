use std::sync::Arc;

use ahash::AHashMap;
use bytes::BytesMut;
use parking_lot::Mutex;
use rtp::header::read_sequence_number;

use crate::{Clock, Error, Storage};

struct Entry {
    sequence_number: u16,
    storage: Storage,
    capture_time_ms: i64,
    /// Zero until the packet first leaves through the pacer or a resend.
    send_time_ms: i64,
    /// Monotonic insert counter; breaks size ties by recency.
    stored_at: u64,
    packet: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    enabled: bool,
    cursor: usize,
    inserts: u64,
    store: Vec<Option<Entry>>,
    index: AHashMap<u16, usize>,
}

/// Bounded ring of recently sent packets keyed by sequence number.
///
/// Resolves NACKs and supplies redundant-payload padding. Capacity
/// overflow silently evicts the oldest entry, which is the only way a
/// packet stops being retransmittable. Lookup misses are quiet; the
/// only error out of here is an oversized insert.
///
/// The ring has its own lock: the pacer re-entry path and the emit path
/// run on different threads and meet nowhere else.
pub struct PacketHistory {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl PacketHistory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Turn storage on with room for `capacity` packets, or off,
    /// dropping everything stored.
    pub fn set_store_status(&self, enable: bool, capacity: usize) {
        let mut inner = self.inner.lock();
        if enable {
            if inner.enabled {
                log::warn!("packet history store status already enabled");
                return;
            }
            inner.enabled = true;
            inner.store = (0..capacity).map(|_| None).collect();
        } else {
            inner.enabled = false;
            inner.store.clear();
        }

        inner.index.clear();
        inner.cursor = 0;
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Remember one outgoing packet according to its storage policy.
    pub fn put(
        &self,
        packet: &[u8],
        max_packet_len: usize,
        capture_time_ms: i64,
        storage: Storage,
    ) -> Result<(), Error> {
        if storage == Storage::DontStore {
            return Ok(());
        }

        let mut inner = self.inner.lock();
        if !inner.enabled || inner.store.is_empty() {
            return Ok(());
        }

        if packet.len() > max_packet_len {
            log::warn!(
                "packet history refused insert: len={} > max={}",
                packet.len(),
                max_packet_len
            );
            return Err(Error::StorageFailure);
        }

        let sequence_number = read_sequence_number(packet);
        let cursor = inner.cursor;
        let stored_at = inner.inserts;
        inner.inserts += 1;

        if let Some(old) = inner.store[cursor].take() {
            if inner.index.get(&old.sequence_number) == Some(&cursor) {
                inner.index.remove(&old.sequence_number);
            }
        }

        inner.index.insert(sequence_number, cursor);
        inner.store[cursor] = Some(Entry {
            sequence_number,
            storage,
            capture_time_ms,
            send_time_ms: 0,
            stored_at,
            packet: packet.to_vec(),
        });

        inner.cursor = (cursor + 1) % inner.store.len();
        Ok(())
    }

    /// Fetch a stored packet and stamp it as sent now.
    ///
    /// Refuses a packet resent less than `min_elapsed_ms` ago, and a
    /// [`Storage::DontRetransmit`] packet when the caller wants it for a
    /// retransmission. A miss returns `None`, never an error.
    pub fn get_and_mark_sent(
        &self,
        sequence_number: u16,
        min_elapsed_ms: i64,
        retransmit: bool,
    ) -> Option<(BytesMut, i64)> {
        let now_ms = self.clock.now_ms();
        let mut inner = self.inner.lock();
        let slot = *inner.index.get(&sequence_number)?;
        let entry = inner.store[slot].as_mut()?;
        if entry.sequence_number != sequence_number {
            return None;
        }

        if entry.send_time_ms > 0
            && min_elapsed_ms > 0
            && now_ms - entry.send_time_ms < min_elapsed_ms
        {
            return None;
        }

        if retransmit && entry.storage == Storage::DontRetransmit {
            return None;
        }

        entry.send_time_ms = now_ms;
        Some((BytesMut::from(&entry.packet[..]), entry.capture_time_ms))
    }

    /// Largest stored packet not exceeding `budget` bytes, most recent
    /// on ties. Used to fill padding budget with redundant payloads.
    pub fn get_best_fitting(&self, budget: usize) -> Option<(BytesMut, i64)> {
        let inner = self.inner.lock();
        let entry = inner
            .store
            .iter()
            .flatten()
            .filter(|entry| entry.packet.len() <= budget)
            .max_by_key(|entry| (entry.packet.len(), entry.stored_at))?;

        Some((BytesMut::from(&entry.packet[..]), entry.capture_time_ms))
    }
}
