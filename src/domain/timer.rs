//! Single-shot timers driven by the event loop.
//!
//! The loop sleeps until [`TimerQueue::next_deadline`] and then feeds every
//! expired entry back into the dispatcher. Cancelling an id that already
//! fired or was already cancelled is a no-op.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Drop inquiry scan on controller `index`.
    DiscoverableTimeout(u16),
    /// Clear the pairable flag on controller `index`.
    PairableTimeout(u16),
    /// Start the next standard-inquiry round on controller `index`.
    Reinquiry(u16),
}

impl TimerKind {
    pub fn index(&self) -> u16 {
        match self {
            TimerKind::DiscoverableTimeout(i)
            | TimerKind::PairableTimeout(i)
            | TimerKind::Reinquiry(i) => *i,
        }
    }
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    next_id: u64,
    entries: BTreeMap<TimerId, (Instant, TimerKind)>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, after: Duration, kind: TimerKind) -> TimerId {
        self.schedule_at(Instant::now() + after, kind)
    }

    pub fn schedule_at(&mut self, deadline: Instant, kind: TimerKind) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.entries.insert(id, (deadline, kind));
        id
    }

    /// Cancel the timer in `slot`, if any, and clear the slot.
    pub fn cancel(&mut self, slot: &mut Option<TimerId>) {
        if let Some(id) = slot.take() {
            self.entries.remove(&id);
        }
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|(deadline, _)| *deadline).min()
    }

    /// Remove and return every timer due at `now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<(TimerId, TimerKind)> {
        let mut due: Vec<(Instant, TimerId, TimerKind)> = self
            .entries
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, (deadline, kind))| (*deadline, *id, *kind))
            .collect();
        due.sort_by_key(|(deadline, id, _)| (*deadline, *id));

        for (_, id, _) in &due {
            self.entries.remove(id);
        }
        due.into_iter().map(|(_, id, kind)| (id, kind)).collect()
    }

    /// Drop every timer belonging to controller `index`.
    pub fn cancel_all_for(&mut self, index: u16) {
        self.entries.retain(|_, (_, kind)| kind.index() != index);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_order() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.schedule_at(now + Duration::from_secs(2), TimerKind::Reinquiry(0));
        timers.schedule_at(now + Duration::from_secs(1), TimerKind::PairableTimeout(0));
        timers.schedule_at(now + Duration::from_secs(9), TimerKind::DiscoverableTimeout(0));

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(1)));
        let fired: Vec<TimerKind> = timers
            .pop_expired(now + Duration::from_secs(3))
            .into_iter()
            .map(|(_, kind)| kind)
            .collect();
        assert_eq!(
            fired,
            vec![TimerKind::PairableTimeout(0), TimerKind::Reinquiry(0)]
        );
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut timers = TimerQueue::new();
        let mut slot = Some(timers.schedule(Duration::from_secs(5), TimerKind::Reinquiry(1)));
        let id = slot.unwrap();
        timers.cancel(&mut slot);
        assert!(slot.is_none());
        assert!(!timers.is_pending(id));
        timers.cancel(&mut slot);

        // Cancelling after expiry is equally harmless.
        let mut fired = Some(timers.schedule(Duration::ZERO, TimerKind::Reinquiry(1)));
        timers.pop_expired(Instant::now() + Duration::from_millis(1));
        timers.cancel(&mut fired);
        assert_eq!(timers.len(), 0);
    }

    #[test]
    fn test_cancel_all_for_index() {
        let mut timers = TimerQueue::new();
        timers.schedule(Duration::from_secs(1), TimerKind::Reinquiry(0));
        timers.schedule(Duration::from_secs(1), TimerKind::Reinquiry(1));
        timers.cancel_all_for(0);
        assert_eq!(timers.len(), 1);
    }
}
