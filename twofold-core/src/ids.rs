//! Snowflake-style identifiers for secret records and peer sessions.
//!
//! Layout of the 64-bit id (most significant bit first):
//! `0 | 41 bits milliseconds since EPOCH_MS | 10 bits worker | 12 bits sequence`.
//! Ids are rendered as decimal strings and sort by creation time.

use rand::Rng;
use std::sync::{Mutex, OnceLock};

/// 2020-01-01T00:00:00Z
pub const EPOCH_MS: i64 = 1_577_836_800_000;

const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_WORKER: u16 = (1 << WORKER_BITS) - 1;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug)]
struct GeneratorState {
    last_ms: i64,
    sequence: u16,
}

/// Thread-safe snowflake id generator.
#[derive(Debug)]
pub struct SnowflakeGenerator {
    worker_id: u16,
    state: Mutex<GeneratorState>,
}

impl SnowflakeGenerator {
    /// Create a generator with an explicit worker id (masked to 10 bits).
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: worker_id & MAX_WORKER,
            state: Mutex::new(GeneratorState {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    /// Create a generator with a random worker id, so two devices minting
    /// ids in the same millisecond still diverge.
    pub fn with_random_worker() -> Self {
        let worker: u16 = rand::thread_rng().gen_range(0..=MAX_WORKER);
        Self::new(worker)
    }

    pub fn worker_id(&self) -> u16 {
        self.worker_id
    }

    /// Generate the next id for the current wall-clock time.
    pub fn generate(&self) -> String {
        self.generate_at(chrono::Utc::now().timestamp_millis())
    }

    /// Generate the next id as if the clock read `now_ms`.
    ///
    /// A clock that moves backwards is clamped to the last issued millisecond.
    /// When the sequence for a millisecond is exhausted the timestamp
    /// advances logically.
    pub fn generate_at(&self, now_ms: i64) -> String {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut ms = now_ms.max(EPOCH_MS).max(state.last_ms);
        if ms == state.last_ms {
            if state.sequence == MAX_SEQUENCE {
                ms += 1;
                state.sequence = 0;
            } else {
                state.sequence += 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = ms;

        let elapsed = (ms - EPOCH_MS) as u64;
        let id = (elapsed << (WORKER_BITS + SEQUENCE_BITS))
            | ((self.worker_id as u64) << SEQUENCE_BITS)
            | state.sequence as u64;
        id.to_string()
    }
}

impl Default for SnowflakeGenerator {
    fn default() -> Self {
        Self::with_random_worker()
    }
}

static PROCESS_GENERATOR: OnceLock<SnowflakeGenerator> = OnceLock::new();

/// Next id from the process-wide generator.
pub fn next_id() -> String {
    PROCESS_GENERATOR
        .get_or_init(SnowflakeGenerator::with_random_worker)
        .generate()
}

/// Extract the creation timestamp (Unix ms) from a snowflake id string.
pub fn timestamp_of(id: &str) -> Option<i64> {
    let raw: u64 = id.parse().ok()?;
    let elapsed = raw >> (WORKER_BITS + SEQUENCE_BITS);
    Some(EPOCH_MS + elapsed as i64)
}

/// Compare two ids by numeric value when both are snowflakes, otherwise
/// lexicographically.
pub fn compare_ids(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}
