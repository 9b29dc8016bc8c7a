//! Wrapper for a periodically-updated value that knows whether it's stale.

use std::fmt;
use std::time::{Duration, Instant};

/// Wraps a value that can be "fresh" or "stale" depending on how long ago
/// it was last [`set`](Fresh::set), relative to a per-instance staleness
/// window.
#[derive(Clone, Copy, Debug)]
pub struct Fresh<VALUE>
where
    VALUE: Copy,
{
    value: Option<(Instant, VALUE)>, // (last set, value)
    stale_after: Duration,
}

impl<VALUE> Fresh<VALUE>
where
    VALUE: Copy,
{
    pub fn new(stale_after: Duration) -> Self {
        Self {
            value: None,
            stale_after,
        }
    }

    /// Set the value and update its last-set timestamp to now.
    pub fn set(&mut self, value: VALUE) {
        self.value = Some((Instant::now(), value));
    }

    /// Prime the last-set timestamp without changing the value, e.g. to grant
    /// a startup grace period before staleness checks kick in.
    pub fn prime_at(&mut self, value: VALUE, when: Instant) {
        self.value = Some((when, value));
    }

    /// Get the value, or `None` if it's stale or was never set.
    pub fn get(&self) -> Option<VALUE> {
        if self.is_fresh() {
            self.get_unchecked()
        } else {
            None
        }
    }

    /// Get the last-set value even if it's stale.
    pub fn get_unchecked(&self) -> Option<VALUE> {
        self.value.map(|(_, value)| value)
    }

    /// How long ago the value was set, or `None` if never set.
    pub fn age(&self) -> Option<Duration> {
        self.value.map(|(last_set, _)| last_set.elapsed())
    }

    pub fn is_fresh(&self) -> bool {
        self.value
            .map(|(last_set, _)| last_set.elapsed() < self.stale_after)
            .unwrap_or(false)
    }

    #[inline]
    pub fn is_stale(&self) -> bool {
        !self.is_fresh()
    }
}

impl<VALUE> fmt::Display for Fresh<VALUE>
where
    VALUE: fmt::Debug + Copy,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some((_, value)) if self.is_fresh() => write!(f, "{:?}", value),
            Some((_, value)) => write!(f, "Stale({:?})", value),
            None => write!(f, "Stale(None)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn fresh_until_stale_after_elapses() {
        let mut f: Fresh<u8> = Fresh::new(Duration::from_millis(20));
        assert!(f.is_stale());
        assert_eq!(f.get(), None);

        f.set(7);
        assert!(f.is_fresh());
        assert_eq!(f.get(), Some(7));

        sleep(Duration::from_millis(30));
        assert!(f.is_stale());
        assert_eq!(f.get(), None);
        assert_eq!(f.get_unchecked(), Some(7));
    }

    #[test]
    fn prime_at_grants_grace_period() {
        let mut f: Fresh<bool> = Fresh::new(Duration::from_millis(10));
        let future = Instant::now() + Duration::from_secs(10);
        f.prime_at(true, future);
        assert!(f.is_fresh());
    }
}
