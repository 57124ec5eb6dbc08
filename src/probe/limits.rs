use std::collections::HashMap;
use std::sync::Mutex;

struct LimitsInner {
    global: u32,
    per_channel: HashMap<String, u32>,
    global_cap: u32,
    channel_cap: u32,
}

/// Counted admission control for the probing engine: one global counter and
/// one per channel. Acquire is all-or-nothing so a refused job never holds a
/// partial slot.
pub struct DetectionLimits {
    inner: Mutex<LimitsInner>,
}

impl DetectionLimits {
    pub fn new(global_cap: u32, channel_cap: u32) -> Self {
        Self {
            inner: Mutex::new(LimitsInner {
                global: 0,
                per_channel: HashMap::new(),
                global_cap: global_cap.max(1),
                channel_cap: channel_cap.max(1),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimitsInner> {
        self.inner.lock().expect("detection limits lock")
    }

    /// Caps come from the scheduler config; a detection trigger refreshes
    /// them before enqueueing.
    pub fn set_caps(&self, global_cap: u32, channel_cap: u32) {
        let mut inner = self.lock();
        inner.global_cap = global_cap.max(1);
        inner.channel_cap = channel_cap.max(1);
    }

    pub fn try_acquire(&self, channel_id: &str) -> bool {
        let mut inner = self.lock();
        if inner.global >= inner.global_cap {
            return false;
        }
        let used = inner.per_channel.get(channel_id).copied().unwrap_or(0);
        if used >= inner.channel_cap {
            return false;
        }
        inner.global += 1;
        inner.per_channel.insert(channel_id.to_string(), used + 1);
        true
    }

    pub fn release(&self, channel_id: &str) {
        let mut inner = self.lock();
        inner.global = inner.global.saturating_sub(1);
        match inner.per_channel.get_mut(channel_id) {
            Some(used) if *used > 1 => *used -= 1,
            Some(_) => {
                inner.per_channel.remove(channel_id);
            }
            None => {}
        }
    }

    /// Pause-and-drain zeroes every counter.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.global = 0;
        inner.per_channel.clear();
    }

    #[cfg(test)]
    fn global_in_use(&self) -> u32 {
        self.lock().global
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_cap_is_enforced() {
        let limits = DetectionLimits::new(2, 10);
        assert!(limits.try_acquire("a"));
        assert!(limits.try_acquire("b"));
        assert!(!limits.try_acquire("c"));
        limits.release("a");
        assert!(limits.try_acquire("c"));
    }

    #[test]
    fn channel_cap_is_enforced() {
        let limits = DetectionLimits::new(10, 1);
        assert!(limits.try_acquire("a"));
        assert!(!limits.try_acquire("a"));
        assert!(limits.try_acquire("b"));
        limits.release("a");
        assert!(limits.try_acquire("a"));
    }

    #[test]
    fn refused_acquire_holds_nothing() {
        let limits = DetectionLimits::new(10, 1);
        assert!(limits.try_acquire("a"));
        assert!(!limits.try_acquire("a"));
        assert_eq!(limits.global_in_use(), 1);
    }

    #[test]
    fn reset_zeroes_counters() {
        let limits = DetectionLimits::new(2, 2);
        assert!(limits.try_acquire("a"));
        assert!(limits.try_acquire("a"));
        limits.reset();
        assert_eq!(limits.global_in_use(), 0);
        assert!(limits.try_acquire("a"));
    }
}
