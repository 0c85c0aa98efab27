use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// A consensus ballot: the high 48 bits are a millisecond timestamp and
/// the low 16 bits an intra-process counter, so ballots order by time
/// first and stay unique within a burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ballot(u64);

impl Ballot {
    pub fn from_u64(raw: u64) -> Self {
        Ballot(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.0 >> 16
    }

    pub fn counter(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl std::fmt::Display for Ballot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues ballots that are strictly greater than every ballot previously
/// issued by this process, even when the clock stalls within a
/// millisecond or steps backwards.
pub struct BallotGenerator {
    inner: Mutex<Inner>,
}

struct Inner {
    counter: u16,
    last: u64,
}

impl BallotGenerator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { counter: 0, last: 0 }),
        }
    }

    pub fn next(&self) -> Ballot {
        let mut inner = self.inner.lock().unwrap();

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        inner.counter = inner.counter.wrapping_add(1);

        let candidate = (now_ms << 16) | inner.counter as u64;
        let issued = candidate.max(inner.last + 1);
        inner.last = issued;

        Ballot(issued)
    }
}

impl Default for BallotGenerator {
    fn default() -> Self {
        Self::new()
    }
}
