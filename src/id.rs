//! Process-wide 64-bit identifiers.
//!
//! Layout, high to low: 1 unused sign bit, 41 bits of milliseconds since
//! [`EPOCH_MS`], 10 bits of node number, 12 bits of per-millisecond sequence.
//! Two processes configured with distinct node numbers can never produce the
//! same value, and values from one process are strictly increasing.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use crate::error::Error;

/// 2010-11-04T01:42:54.657Z
pub const EPOCH_MS: i64 = 1_288_834_974_657;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;

pub const MAX_NODE: i64 = (1 << NODE_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// Lock-free identifier source. Construct one per process at startup and
/// share it.
#[derive(Debug)]
pub struct IdGenerator {
    node: i64,
    start: Instant,
    start_ms: u64,
    // (elapsed millis since EPOCH_MS << SEQUENCE_BITS) | sequence
    state: AtomicU64,
}

impl IdGenerator {
    pub fn new(node: i64) -> Result<Self, Error> {
        if !(0..=MAX_NODE).contains(&node) {
            return Err(Error::InvalidNodeNumber {
                node,
                max: MAX_NODE,
            });
        }

        let now = chrono::Utc::now().timestamp_millis();

        Ok(Self {
            node,
            start: Instant::now(),
            start_ms: (now - EPOCH_MS).max(0) as u64,
            state: AtomicU64::new(0),
        })
    }

    pub fn node(&self) -> i64 {
        self.node
    }

    // Anchored to a monotonic clock so wall-clock adjustments cannot move
    // generated ids backwards.
    fn elapsed_ms(&self) -> u64 {
        self.start_ms + self.start.elapsed().as_millis() as u64
    }

    pub fn next_id(&self) -> i64 {
        loop {
            let now = self.elapsed_ms();
            let prev = self.state.load(Ordering::Acquire);
            let prev_ms = prev >> SEQUENCE_BITS;
            let prev_seq = prev & MAX_SEQUENCE;

            let next = if now > prev_ms {
                now << SEQUENCE_BITS
            } else if prev_seq < MAX_SEQUENCE {
                prev + 1
            } else {
                // Sequence exhausted for this millisecond.
                std::hint::spin_loop();
                continue;
            };

            if self
                .state
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let millis = (next >> SEQUENCE_BITS) as i64;
                let sequence = (next & MAX_SEQUENCE) as i64;
                return (millis << (NODE_BITS + SEQUENCE_BITS))
                    | (self.node << SEQUENCE_BITS)
                    | sequence;
            }
        }
    }

    /// Splits an identifier into `(unix millis, node, sequence)`.
    pub fn decompose(id: i64) -> (i64, i64, i64) {
        let millis = (id >> (NODE_BITS + SEQUENCE_BITS)) + EPOCH_MS;
        let node = (id >> SEQUENCE_BITS) & MAX_NODE;
        let sequence = id & MAX_SEQUENCE as i64;
        (millis, node, sequence)
    }
}
