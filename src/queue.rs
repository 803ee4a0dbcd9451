//! FIFO admission queue and slot accounting.
//!
//! The queue is the only authority on the global concurrency budget. Slot
//! acquisition, release, and head admission are explicit operations so the
//! registry can run "release then admit" as one critical section and never
//! lose a wakeup or admit two projects into one freed slot. The queue knows
//! nothing about project state; the registry keeps the two in step.

use std::collections::VecDeque;

use uuid::Uuid;

use crate::error::{HerdError, Result};

/// FIFO queue of projects waiting for a concurrency slot.
#[derive(Debug)]
pub struct AdmissionQueue {
    max_slots: usize,
    max_waiting: usize,
    occupied: usize,
    waiting: VecDeque<Uuid>,
}

impl AdmissionQueue {
    /// Create a queue with the given slot budget and waiting-list capacity.
    pub fn new(max_slots: usize, max_waiting: usize) -> Self {
        Self {
            max_slots,
            max_waiting,
            occupied: 0,
            waiting: VecDeque::new(),
        }
    }

    /// Number of currently occupied slots.
    pub fn occupied(&self) -> usize {
        self.occupied
    }

    /// Number of projects waiting.
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Claim a slot if one is free. Returns false when the budget is spent.
    pub fn try_acquire_slot(&mut self) -> bool {
        if self.occupied < self.max_slots {
            self.occupied += 1;
            true
        } else {
            false
        }
    }

    /// Return a slot to the budget.
    pub fn release_slot(&mut self) {
        self.occupied = self.occupied.saturating_sub(1);
    }

    /// Pop the queue head into a free slot, if both exist.
    ///
    /// The popped project's slot is already claimed on return; the caller
    /// only has to start it. Call directly after [`Self::release_slot`]
    /// within the same critical section.
    pub fn admit_next(&mut self) -> Option<Uuid> {
        if self.occupied >= self.max_slots {
            return None;
        }
        let id = self.waiting.pop_front()?;
        self.occupied += 1;
        Some(id)
    }

    /// Append a project to the waiting list and return its 1-based position.
    ///
    /// Enqueueing an already-waiting project returns its current position.
    ///
    /// # Errors
    ///
    /// Returns [`HerdError::QueueFull`] at capacity.
    pub fn enqueue(&mut self, id: Uuid) -> Result<usize> {
        if let Some(pos) = self.position(id) {
            return Ok(pos);
        }
        if self.waiting.len() >= self.max_waiting {
            return Err(HerdError::QueueFull {
                max: self.max_waiting,
            });
        }
        self.waiting.push_back(id);
        Ok(self.waiting.len())
    }

    /// Remove a waiting project (queued stop). Returns false if not waiting.
    pub fn remove(&mut self, id: Uuid) -> bool {
        if let Some(idx) = self.waiting.iter().position(|q| *q == id) {
            self.waiting.remove(idx);
            true
        } else {
            false
        }
    }

    /// 1-based position of a waiting project.
    pub fn position(&self, id: Uuid) -> Option<usize> {
        self.waiting.iter().position(|q| *q == id).map(|i| i + 1)
    }

    /// Dense 1-based positions of every waiting project, head first.
    ///
    /// The registry republishes these onto the queued contexts after every
    /// structural change so `queue_position` stays a gapless permutation.
    pub fn positions(&self) -> Vec<(Uuid, usize)> {
        self.waiting
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i + 1))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    #[test]
    fn test_slot_budget() {
        let mut q = AdmissionQueue::new(2, 10);
        assert!(q.try_acquire_slot());
        assert!(q.try_acquire_slot());
        assert!(!q.try_acquire_slot());
        assert_eq!(q.occupied(), 2);

        q.release_slot();
        assert!(q.try_acquire_slot());
    }

    #[test]
    fn test_release_never_underflows() {
        let mut q = AdmissionQueue::new(1, 1);
        q.release_slot();
        assert_eq!(q.occupied(), 0);
    }

    #[test]
    fn test_fifo_admission_order() {
        let mut q = AdmissionQueue::new(1, 10);
        assert!(q.try_acquire_slot());

        let p = ids(3);
        for id in &p {
            q.enqueue(*id).unwrap();
        }

        q.release_slot();
        assert_eq!(q.admit_next(), Some(p[0]));
        // the freed slot is spent; the next head stays queued
        assert_eq!(q.admit_next(), None);

        q.release_slot();
        assert_eq!(q.admit_next(), Some(p[1]));
    }

    #[test]
    fn test_admit_claims_the_slot() {
        let mut q = AdmissionQueue::new(1, 10);
        let p = ids(1);
        q.enqueue(p[0]).unwrap();
        assert_eq!(q.admit_next(), Some(p[0]));
        assert_eq!(q.occupied(), 1);
        assert!(!q.try_acquire_slot());
    }

    #[test]
    fn test_positions_are_dense_after_removal() {
        let mut q = AdmissionQueue::new(0, 10);
        let p = ids(4);
        for id in &p {
            q.enqueue(*id).unwrap();
        }

        assert!(q.remove(p[1]));
        let positions = q.positions();
        assert_eq!(
            positions,
            vec![(p[0], 1), (p[2], 2), (p[3], 3)],
            "positions must stay a dense 1-based permutation"
        );
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let mut q = AdmissionQueue::new(0, 10);
        let p = ids(2);
        assert_eq!(q.enqueue(p[0]).unwrap(), 1);
        assert_eq!(q.enqueue(p[1]).unwrap(), 2);
        assert_eq!(q.enqueue(p[0]).unwrap(), 1);
        assert_eq!(q.waiting(), 2);
    }

    #[test]
    fn test_queue_full() {
        let mut q = AdmissionQueue::new(0, 2);
        let p = ids(3);
        q.enqueue(p[0]).unwrap();
        q.enqueue(p[1]).unwrap();
        let err = q.enqueue(p[2]).unwrap_err();
        assert!(matches!(err, HerdError::QueueFull { max: 2 }));
    }

    #[test]
    fn test_remove_unknown_is_false() {
        let mut q = AdmissionQueue::new(0, 2);
        assert!(!q.remove(Uuid::new_v4()));
    }
}
