//! Bounded per-domain decision log.
//!
//! Producers run on the update path and only ever hold the lock for one slot
//! copy. The exporter takes everything out in one short critical section and
//! does all formatting after releasing it.

use std::fmt;

use parking_lot::Mutex;

use crate::{
    error::{GovernorError, GovernorResult},
    utils::constants::EVENT_COUNT,
};

/// One decision: the counter deltas it was based on and the frequency asked for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: u64,
    pub perf_values: [u64; EVENT_COUNT],
    pub requested_freq: u32,
    pub unit_id: u32,
}

impl fmt::Display for LogEntry {
    /// `cpu,timestamp,value1,value2,value3,requested_freq`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [v1, v2, v3] = self.perf_values;
        write!(
            f,
            "{},{},{},{},{},{}",
            self.unit_id, self.timestamp, v1, v2, v3, self.requested_freq
        )
    }
}

/// Entries in chronological order plus whether any were lost
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub entries: Vec<LogEntry>,
    pub overflowed: bool,
}

struct RingState {
    entries: Vec<LogEntry>,
    insert_offset: usize,
    /// every slot holds an entry written since the last clear
    full: bool,
    /// an unexported entry has been overwritten since the last clear
    overflowed: bool,
}

pub struct TelemetryRingBuffer {
    capacity: usize,
    state: Mutex<RingState>,
}

impl TelemetryRingBuffer {
    pub fn new(capacity: usize) -> GovernorResult<Self> {
        if capacity == 0 {
            return Err(GovernorError::AllocationFailure {
                what: "ring buffer",
                reason: "capacity must be greater than 0".into(),
            });
        }

        let mut entries = Vec::new();
        entries
            .try_reserve_exact(capacity)
            .map_err(|e| GovernorError::AllocationFailure {
                what: "ring buffer",
                reason: e.to_string(),
            })?;
        entries.resize(capacity, LogEntry::default());

        Ok(Self {
            capacity,
            state: Mutex::new(RingState {
                entries,
                insert_offset: 0,
                full: false,
                overflowed: false,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries currently held
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        if state.full {
            self.capacity
        } else {
            state.insert_offset
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// O(1) under the lock, safe on the update path
    pub fn append(&self, entry: LogEntry) {
        let mut state = self.state.lock();
        let offset = state.insert_offset;
        if state.full {
            state.overflowed = true;
        }
        state.entries[offset] = entry;
        state.insert_offset = (offset + 1) % self.capacity;
        if state.insert_offset == 0 {
            state.full = true;
        }
    }

    /// Takes every held entry out, oldest first, and resets the buffer
    pub fn snapshot_and_clear(&self) -> Snapshot {
        // allocate before taking the lock
        let mut out = Vec::with_capacity(self.capacity);

        let (start, overflowed) = {
            let mut state = self.state.lock();
            let start = if state.full {
                out.extend_from_slice(&state.entries);
                state.insert_offset
            } else {
                out.extend_from_slice(&state.entries[..state.insert_offset]);
                0
            };
            let overflowed = state.overflowed;
            state.insert_offset = 0;
            state.full = false;
            state.overflowed = false;
            (start, overflowed)
        };

        // oldest surviving entry sits at the old insert offset
        out.rotate_left(start);
        Snapshot {
            entries: out,
            overflowed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn entry(n: u64) -> LogEntry {
        LogEntry {
            timestamp: n,
            perf_values: [n, n * 2, n * 3],
            requested_freq: n as u32,
            unit_id: 1,
        }
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            TelemetryRingBuffer::new(0),
            Err(GovernorError::AllocationFailure { .. })
        ));
    }

    #[test]
    fn partial_fill_returns_insertion_order() {
        let ring = TelemetryRingBuffer::new(8).unwrap();
        for n in 0..5 {
            ring.append(entry(n));
        }
        assert_eq!(ring.len(), 5);

        let snapshot = ring.snapshot_and_clear();
        assert!(!snapshot.overflowed);
        assert_eq!(snapshot.entries, (0..5).map(entry).collect::<Vec<_>>());
        assert!(ring.is_empty());
    }

    #[test]
    fn exactly_full_is_not_overflow() {
        let ring = TelemetryRingBuffer::new(8).unwrap();
        for n in 0..8 {
            ring.append(entry(n));
        }
        let snapshot = ring.snapshot_and_clear();
        assert!(!snapshot.overflowed);
        assert_eq!(snapshot.entries, (0..8).map(entry).collect::<Vec<_>>());
    }

    #[test]
    fn overflow_keeps_newest_oldest_first() {
        let ring = TelemetryRingBuffer::new(8).unwrap();
        for n in 0..13 {
            ring.append(entry(n));
        }

        let snapshot = ring.snapshot_and_clear();
        assert!(snapshot.overflowed);
        assert_eq!(snapshot.entries, (5..13).map(entry).collect::<Vec<_>>());

        let again = ring.snapshot_and_clear();
        assert!(again.entries.is_empty());
        assert!(!again.overflowed);
    }

    #[test]
    fn clear_starts_a_fresh_cycle() {
        let ring = TelemetryRingBuffer::new(4).unwrap();
        for n in 0..10 {
            ring.append(entry(n));
        }
        ring.snapshot_and_clear();

        ring.append(entry(100));
        let snapshot = ring.snapshot_and_clear();
        assert_eq!(snapshot.entries, vec![entry(100)]);
        assert!(!snapshot.overflowed);
    }

    #[test]
    fn line_format() {
        let line = LogEntry {
            timestamp: 123,
            perf_values: [1, 2, 3],
            requested_freq: 2_400_000,
            unit_id: 7,
        }
        .to_string();
        assert_eq!(line, "7,123,1,2,3,2400000");
    }

    #[test]
    fn concurrent_writers_never_lose_slots() {
        const WRITERS: u64 = 4;
        const PER_WRITER: u64 = 500;
        let ring = Arc::new(TelemetryRingBuffer::new(4096).unwrap());

        let handles: Vec<_> = (0..WRITERS)
            .map(|w| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for n in 0..PER_WRITER {
                        ring.append(LogEntry {
                            timestamp: n,
                            unit_id: w as u32,
                            ..Default::default()
                        });
                    }
                })
            })
            .collect();

        let mut collected = Vec::new();
        for handle in handles {
            handle.join().unwrap();
        }
        collected.extend(ring.snapshot_and_clear().entries);

        assert_eq!(collected.len() as u64, WRITERS * PER_WRITER);
        for w in 0..WRITERS {
            let stamps: Vec<u64> = collected
                .iter()
                .filter(|e| e.unit_id == w as u32)
                .map(|e| e.timestamp)
                .collect();
            assert_eq!(stamps, (0..PER_WRITER).collect::<Vec<_>>());
        }
    }

    #[test]
    fn snapshot_during_writes_is_consistent() {
        let ring = Arc::new(TelemetryRingBuffer::new(64).unwrap());
        let writer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for n in 0..10_000 {
                    ring.append(entry(n));
                }
            })
        };

        let mut total = 0;
        let mut last = None;
        while !writer.is_finished() || !ring.is_empty() {
            let snapshot = ring.snapshot_and_clear();
            for e in &snapshot.entries {
                if let Some(prev) = last {
                    assert!(e.timestamp > prev);
                }
                last = Some(e.timestamp);
            }
            total += snapshot.entries.len();
        }
        writer.join().unwrap();
        assert!(total <= 10_000);
        assert_eq!(last, Some(9_999));
    }
}
