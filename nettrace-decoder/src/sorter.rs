use std::collections::{HashMap, VecDeque};

use nettrace_format::{ByteReader, EventHeader, FormatError};
use tracing::debug;

use crate::Result;

/// An event buffered until the stream proves nothing older can still arrive.
/// Owns its payload and stack bytes; the originating block buffer is reused.
#[derive(Debug)]
pub struct PendingEvent {
    pub header: EventHeader,
    pub payload: Vec<u8>,
    pub stack: Vec<u8>,
}

#[derive(Debug, Default)]
struct ThreadQueue {
    /// Highest sequence number observed from the stream. Pending sequences
    /// are contiguous up to this, so the next in-order event is exactly
    /// `last_enqueued_seq + 1`.
    last_enqueued_seq: u32,
    /// Resynchronisation floor from the latest sequence point; anything at
    /// or below it is a stale duplicate.
    sequence_floor: u32,
    pending: VecDeque<PendingEvent>,
}

/// Buffers per-capture-thread event streams and merges them into global
/// timestamp order.
///
/// Within a block each capture thread is monotonic in sequence number, but
/// threads interleave arbitrarily. A sorted event guarantees every older
/// same-thread event already appeared, so its timestamp is a release
/// barrier; sequence points are hard barriers that also resynchronise the
/// per-thread sequence counters.
#[derive(Debug, Default)]
pub struct EventCache {
    threads: HashMap<u64, ThreadQueue>,
    events_lost: i32,
}

impl EventCache {
    pub fn new() -> Self {
        EventCache::default()
    }

    /// Saturating count of events the stream declared but never delivered.
    pub fn events_lost(&self) -> i32 {
        self.events_lost
    }

    pub fn pending_count(&self) -> usize {
        self.threads.values().map(|q| q.pending.len()).sum()
    }

    /// Enqueue one decoded event. If it is sorted, every event at or before
    /// its timestamp becomes releasable and is emitted immediately.
    pub fn enqueue(
        &mut self,
        event: PendingEvent,
        emit: &mut dyn FnMut(PendingEvent) -> Result<()>,
    ) -> Result<()> {
        let thread = event.header.capture_thread_id;
        let observed = event.header.sequence_number;
        let gap = {
            let queue = self.threads.entry(thread).or_default();
            let expected = u64::from(queue.last_enqueued_seq) + 1;
            let gap = u64::from(observed).saturating_sub(expected);
            if observed > queue.last_enqueued_seq {
                queue.last_enqueued_seq = observed;
            }
            gap
        };
        if gap > 0 {
            self.account_lost(gap);
        }

        let barrier = event.header.is_sorted.then_some(event.header.timestamp);
        self.threads.entry(thread).or_default().pending.push_back(event);
        if let Some(timestamp) = barrier {
            self.release_until(timestamp, emit)?;
        }
        Ok(())
    }

    /// Sequence point: timestamp, thread count, then per-thread sequence
    /// resynchronisation entries.
    pub fn process_sequence_point(
        &mut self,
        contents: &[u8],
        emit: &mut dyn FnMut(PendingEvent) -> Result<()>,
    ) -> Result<()> {
        let mut r = ByteReader::new(contents);
        let timestamp = r.read_i64()? as u64;
        let thread_count = r.read_i32()?;
        if thread_count < 0 {
            return Err(FormatError::InvalidFormat("negative sequence point thread count").into());
        }

        self.release_until(timestamp, emit)?;

        for _ in 0..thread_count {
            let capture_thread_id = r.read_i64()? as u64;
            let sequence_number = r.read_i32()? as u32;
            let queue = self.threads.entry(capture_thread_id).or_default();

            let covered = u64::from(queue.last_enqueued_seq);
            let declared = u64::from(sequence_number);
            if declared > covered {
                queue.last_enqueued_seq = sequence_number;
                self.events_lost = saturating_add_u64(self.events_lost, declared - covered);
                debug!(
                    capture_thread_id,
                    lost = declared - covered,
                    "sequence point revealed dropped events"
                );
            }

            let queue = self.threads.entry(capture_thread_id).or_default();
            if sequence_number > queue.sequence_floor {
                queue.sequence_floor = sequence_number;
            }
            // Anything still buffered at or below the resynchronised
            // sequence is a stale duplicate.
            while let Some(front) = queue.pending.front() {
                if front.header.sequence_number <= queue.sequence_floor {
                    debug!(
                        capture_thread_id,
                        sequence_number = front.header.sequence_number,
                        "dropping duplicate event below the sequence point floor"
                    );
                    queue.pending.pop_front();
                } else {
                    break;
                }
            }
        }
        Ok(())
    }

    /// End of stream: everything still pending goes out in timestamp order.
    pub fn flush(&mut self, emit: &mut dyn FnMut(PendingEvent) -> Result<()>) -> Result<()> {
        self.release_until(u64::MAX, emit)
    }

    /// Emit all pending events with `timestamp <= barrier` in timestamp
    /// order, ties broken by (capture thread, sequence number). Per-thread
    /// queues are sequence-ordered, so a k-way merge over queue fronts
    /// yields the global order.
    fn release_until(
        &mut self,
        barrier: u64,
        emit: &mut dyn FnMut(PendingEvent) -> Result<()>,
    ) -> Result<()> {
        loop {
            let mut best: Option<(u64, u64, u32)> = None;
            for (&thread, queue) in &self.threads {
                if let Some(front) = queue.pending.front() {
                    let key = (front.header.timestamp, thread, front.header.sequence_number);
                    if best.is_none_or(|current| key < current) {
                        best = Some(key);
                    }
                }
            }
            let Some((timestamp, thread, _)) = best else {
                return Ok(());
            };
            if timestamp > barrier {
                return Ok(());
            }
            if let Some(queue) = self.threads.get_mut(&thread) {
                if let Some(event) = queue.pending.pop_front() {
                    emit(event)?;
                }
            }
        }
    }

    fn account_lost(&mut self, gap: u64) {
        self.events_lost = saturating_add_u64(self.events_lost, gap);
        debug!(gap, total = self.events_lost, "sequence gap detected");
    }
}

fn saturating_add_u64(current: i32, add: u64) -> i32 {
    let add = i32::try_from(add).unwrap_or(i32::MAX);
    current.saturating_add(add)
}
