//! Per-connection event buffer.

use std::{collections::VecDeque, time::Duration};

use crate::types::{Event, EventFilter};

/// How long an event operation may wait when nothing is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wait {
    /// Return immediately.
    #[default]
    No,
    /// Block until an event arrives.
    Forever,
    /// Block up to the given duration, then fail with [`crate::Error::Timeout`].
    Timeout(Duration),
}

impl From<bool> for Wait {
    fn from(wait: bool) -> Self {
        if wait { Self::Forever } else { Self::No }
    }
}

impl From<Duration> for Wait {
    fn from(timeout: Duration) -> Self {
        Self::Timeout(timeout)
    }
}

impl From<Option<Duration>> for Wait {
    /// `None` waits forever.
    fn from(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(t) => Self::Timeout(t),
            None => Self::Forever,
        }
    }
}

/// Events in arrival order.
#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub(crate) fn push(&mut self, event: Event) {
        self.events.push_back(event);
    }

    /// Oldest event first.
    pub(crate) fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub(crate) fn snapshot(&self) -> Vec<Event> {
        self.events.iter().cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.events.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Remove and return the oldest event accepted by any of `filters`.
    pub(crate) fn take_matching(&mut self, filters: &[EventFilter]) -> Option<Event> {
        self.take_matching_from(0, filters)
    }

    /// Like [`Self::take_matching`], ignoring the first `start` entries.
    pub(crate) fn take_matching_from(
        &mut self,
        start: usize,
        filters: &[EventFilter],
    ) -> Option<Event> {
        let pos = self
            .events
            .iter()
            .skip(start)
            .position(|ev| filters.iter().any(|f| f.matches(ev)))?;
        self.events.remove(start + pos)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn ev(name: &str) -> Event {
        Event {
            name: name.to_string(),
            data: Value::Null,
            timestamp: None,
        }
    }

    #[test]
    fn pops_in_fifo_order() {
        let mut q = EventQueue::default();
        q.push(ev("A"));
        q.push(ev("B"));
        assert_eq!(q.pop().map(|e| e.name), Some("A".to_string()));
        assert_eq!(q.pop().map(|e| e.name), Some("B".to_string()));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn snapshot_does_not_consume() {
        let mut q = EventQueue::default();
        q.push(ev("A"));
        assert_eq!(q.snapshot().len(), 1);
        assert_eq!(q.len(), 1);
        q.clear();
        assert!(q.is_empty());
    }

    #[test]
    fn take_matching_leaves_others_in_place() {
        let mut q = EventQueue::default();
        q.push(ev("A"));
        q.push(ev("B"));
        q.push(ev("C"));

        let got = q.take_matching(&[EventFilter::named("B")]);
        assert_eq!(got.map(|e| e.name), Some("B".to_string()));
        let rest: Vec<_> = q.snapshot().into_iter().map(|e| e.name).collect();
        assert_eq!(rest, vec!["A", "C"]);

        assert!(q.take_matching_from(1, &[EventFilter::named("A")]).is_none());
    }

    #[test]
    fn wait_conversions() {
        assert_eq!(Wait::from(false), Wait::No);
        assert_eq!(Wait::from(true), Wait::Forever);
        assert_eq!(
            Wait::from(Duration::from_secs(1)),
            Wait::Timeout(Duration::from_secs(1))
        );
        assert_eq!(Wait::from(None::<Duration>), Wait::Forever);
    }
}
