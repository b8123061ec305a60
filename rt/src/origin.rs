//! Tracking where task-local boxes are allocated.
//!
//! Origin tracking is a debugging aid: when enabled, every allocation records
//! an (unresolved) backtrace, which is resolved only when we actually need to
//! report it, such as when a task leaks boxes.
use crate::mem::OpaqueBox;
use backtrace::Backtrace;
use std::collections::HashMap;

pub(crate) struct OriginTracker {
    origins: HashMap<usize, Backtrace>,
}

impl OriginTracker {
    pub(crate) fn new() -> Self {
        Self { origins: HashMap::new() }
    }

    pub(crate) fn track(&mut self, boxed: *mut OpaqueBox) {
        self.origins.insert(boxed as usize, Backtrace::new_unresolved());
    }

    pub(crate) fn untrack(&mut self, boxed: *mut OpaqueBox) {
        self.origins.remove(&(boxed as usize));
    }

    /// Returns a description of where the given box was allocated.
    pub(crate) fn origin(&mut self, boxed: *mut OpaqueBox) -> Option<String> {
        self.origins.get_mut(&(boxed as usize)).map(|trace| {
            trace.resolve();
            format!("{:?}", trace)
        })
    }

    /// Returns the addresses of all boxes still tracked.
    pub(crate) fn tracked(&self) -> Vec<*mut OpaqueBox> {
        self.origins.keys().map(|&ptr| ptr as *mut OpaqueBox).collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.origins.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track() {
        let mut tracker = OriginTracker::new();
        let boxed = 0x10 as *mut OpaqueBox;

        tracker.track(boxed);

        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.tracked(), vec![boxed]);
    }

    #[test]
    fn test_untrack() {
        let mut tracker = OriginTracker::new();
        let boxed = 0x10 as *mut OpaqueBox;

        tracker.track(boxed);
        tracker.untrack(boxed);
        tracker.untrack(0x20 as *mut OpaqueBox);

        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn test_origin() {
        let mut tracker = OriginTracker::new();
        let boxed = 0x10 as *mut OpaqueBox;

        assert!(tracker.origin(boxed).is_none());

        tracker.track(boxed);

        assert!(tracker.origin(boxed).is_some());
    }
}
