//! Bounded FIFO of signals waiting for a worker's drain loop

use std::collections::VecDeque;
use tokio::sync::oneshot;

use super::error::{RuntimeError, RuntimeResult};
use super::signal::{Signal, SignalClass};
use serde_json::Value;

/// Reply slot for a synchronous caller
pub type Reply = oneshot::Sender<RuntimeResult<Value>>;

/// A queued signal plus the caller waiting on it, if any
#[derive(Debug)]
pub struct Pending {
    /// The signal
    pub signal: Signal,
    /// Present for `call`, absent for `cast`
    pub reply: Option<Reply>,
}

/// Bounded signal queue; pushes past capacity fail instead of blocking
#[derive(Debug)]
pub struct SignalQueue {
    items: VecDeque<Pending>,
    max: usize,
}

impl SignalQueue {
    /// Queue holding at most `max` signals
    pub fn new(max: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max,
        }
    }

    /// Append; fails with `QueueOverflow` when full, leaving the queue unchanged
    pub fn push(&mut self, pending: Pending) -> Result<(), (RuntimeError, Pending)> {
        if self.items.len() >= self.max {
            return Err((RuntimeError::QueueOverflow { max: self.max }, pending));
        }
        self.items.push_back(pending);
        Ok(())
    }

    /// Oldest signal
    pub fn pop(&mut self) -> Option<Pending> {
        self.items.pop_front()
    }

    /// Remove the oldest system signal, keeping everything else in order
    pub fn take_system(&mut self) -> Option<Pending> {
        let index = self
            .items
            .iter()
            .position(|pending| pending.signal.class() == SignalClass::System)?;
        self.items.remove(index)
    }

    /// Remove everything, oldest first
    pub fn drain(&mut self) -> Vec<Pending> {
        self.items.drain(..).collect()
    }

    /// Queued signals
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::signal::{SYSTEM_PAUSE, SYSTEM_RESUME};
    use proptest::prelude::*;

    fn pending(signal_type: &str) -> Pending {
        Pending {
            signal: Signal::new(signal_type, Value::Null),
            reply: None,
        }
    }

    #[test]
    fn test_overflow_at_capacity() {
        let mut queue = SignalQueue::new(2);
        assert!(queue.push(pending("a.one")).is_ok());
        assert!(queue.push(pending("a.two")).is_ok());
        let (err, rejected) = queue.push(pending("a.three")).unwrap_err();

        assert!(matches!(err, RuntimeError::QueueOverflow { max: 2 }));
        assert_eq!(rejected.signal.signal_type, "a.three");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_take_system_preserves_order() {
        let mut queue = SignalQueue::new(8);
        for ty in ["a.one", SYSTEM_PAUSE, "a.two", SYSTEM_RESUME] {
            queue.push(pending(ty)).unwrap();
        }
        assert_eq!(queue.take_system().unwrap().signal.signal_type, SYSTEM_PAUSE);
        assert_eq!(queue.take_system().unwrap().signal.signal_type, SYSTEM_RESUME);
        assert!(queue.take_system().is_none());

        let rest: Vec<_> = queue.drain().into_iter().map(|p| p.signal.signal_type).collect();
        assert_eq!(rest, vec!["a.one", "a.two"]);
    }

    proptest! {
        #[test]
        fn prop_length_never_exceeds_max(max in 0usize..16, ops in prop::collection::vec(any::<bool>(), 0..64)) {
            let mut queue = SignalQueue::new(max);
            for push in ops {
                if push {
                    let before = queue.len();
                    match queue.push(pending("a.b")) {
                        Ok(()) => prop_assert_eq!(queue.len(), before + 1),
                        Err(_) => prop_assert_eq!(queue.len(), max),
                    }
                } else {
                    queue.pop();
                }
                prop_assert!(queue.len() <= max);
            }
        }
    }
}
