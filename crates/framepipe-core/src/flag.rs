// crates/framepipe-core/src/flag.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared termination flag: settable by any party, observable by all,
/// never cleared once set.
///
/// Each pipeline worker owns one; the manager holds clones of all four so
/// `done()` and `join_safe()` can signal everything at once. Plain
/// `Relaxed` ordering is enough: the flag carries no data, and every
/// loop that polls it also synchronises through a queue operation.
#[derive(Debug, Clone, Default)]
pub struct DoneFlag(Arc<AtomicBool>);

impl DoneFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_sticky_and_shared() {
        let flag = DoneFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_set());
        flag.set();
        assert!(observer.is_set());
        flag.set();
        assert!(flag.is_set());
    }
}
