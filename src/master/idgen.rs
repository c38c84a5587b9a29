//! Snowflake-style ID generator
//!
//! 41 bits of milliseconds since a fixed epoch, 10 bits of node number and
//! 12 bits of sequence. IDs from one generator are strictly increasing; when
//! a millisecond's sequence is exhausted the generator moves on to the next
//! millisecond instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};

use super::error::{MasterError, Result};

/// 2010-11-04T01:42:54.657Z
const EPOCH_MS: u64 = 1_288_834_974_657;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_NODE: u16 = (1 << NODE_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug)]
pub struct IdGenerator {
    node: u16,
    // (milliseconds since epoch << SEQUENCE_BITS) | sequence
    state: AtomicU64,
}

impl IdGenerator {
    pub fn new(node: u16) -> Result<Self> {
        if node > MAX_NODE {
            return Err(MasterError::IdGen(format!(
                "node number {node} exceeds {MAX_NODE}"
            )));
        }
        Ok(Self {
            node,
            state: AtomicU64::new(0),
        })
    }

    pub fn generate(&self) -> u64 {
        let now = now_ms();
        let mut current = self.state.load(Ordering::Relaxed);

        loop {
            let last_ms = current >> SEQUENCE_BITS;
            let sequence = current & MAX_SEQUENCE;

            let next = if now > last_ms {
                now << SEQUENCE_BITS
            } else if sequence < MAX_SEQUENCE {
                current + 1
            } else {
                (last_ms + 1) << SEQUENCE_BITS
            };

            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    let ms = next >> SEQUENCE_BITS;
                    let sequence = next & MAX_SEQUENCE;
                    return (ms << (NODE_BITS + SEQUENCE_BITS))
                        | (u64::from(self.node) << SEQUENCE_BITS)
                        | sequence;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Decimal string form, as stored in resource records
    pub fn generate_string(&self) -> String {
        self.generate().to_string()
    }
}

fn now_ms() -> u64 {
    let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
    now.saturating_sub(EPOCH_MS)
}
