#![allow(clippy::cast_possible_truncation)]

use std::time::{Duration, Instant};

#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

#[must_use]
pub const fn align_down(val: u64, align: u64) -> u64 {
    val & !(align - 1)
}

#[must_use]
pub const fn is_aligned(val: u64, align: u64) -> bool {
    val & (align - 1) == 0
}

/// Floor of log2. `val` must be non-zero.
#[must_use]
pub const fn ilog2(val: u64) -> u32 {
    63 - val.leading_zeros()
}

/// Smallest `order` such that `1 << order >= val`.
#[must_use]
pub const fn order_for(val: u64) -> u32 {
    if val <= 1 {
        0
    } else {
        64 - (val - 1).leading_zeros()
    }
}

// ===============================================================================================
// Bounded Polling
// ===============================================================================================

/// Exponential backoff between polls of a hardware status bit.
///
/// The delay starts at `initial`, doubles after every poll and saturates at `max`.
/// Waiting stops once the deadline has passed; there is no external cancellation.
#[derive(Debug)]
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    deadline: Instant,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration, timeout: Duration) -> Self {
        Self {
            delay: initial,
            max_delay: max.max(initial),
            deadline: Instant::now() + timeout,
        }
    }

    #[must_use]
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Sleeps for the current delay (never past the deadline) and doubles it.
    pub fn snooze(&mut self) {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        std::thread::sleep(self.delay.min(remaining));
        self.delay = (self.delay * 2).min(self.max_delay);
    }
}

/// Polls `done` with exponential backoff. Returns `true` if it reported completion
/// before `timeout` elapsed.
pub fn poll_with_backoff(
    initial: Duration,
    max: Duration,
    timeout: Duration,
    mut done: impl FnMut() -> bool,
) -> bool {
    let mut backoff = Backoff::new(initial, max, timeout);
    loop {
        if done() {
            return true;
        }
        if backoff.expired() {
            return false;
        }
        backoff.snooze();
    }
}

// ===============================================================================================
// Bitmap
// ===============================================================================================

/// Fixed-size bitmap indexed by channel or group ID.
#[derive(Debug, Clone)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    #[must_use]
    pub fn test(&self, bit: usize) -> bool {
        assert!(bit < self.len, "bit {bit} out of range ({})", self.len);
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    /// Sets `bit` and returns its previous value.
    pub fn test_and_set(&mut self, bit: usize) -> bool {
        let old = self.test(bit);
        self.words[bit / 64] |= 1 << (bit % 64);
        old
    }

    /// Clears `bit` and returns its previous value.
    pub fn test_and_clear(&mut self, bit: usize) -> bool {
        let old = self.test(bit);
        self.words[bit / 64] &= !(1 << (bit % 64));
        old
    }

    #[must_use]
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterates set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(idx, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(idx * 64 + bit)
            })
        })
    }
}
