//! Dispatch ordering
//!
//! Tickets are issued in utterance start order. A turn may resolve its intent
//! only once every earlier ticket has been released, so commands take effect
//! in the order they were spoken. Tickets release on drop, covering every
//! exit path of a turn.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::FailureReason;

#[derive(Debug, Default)]
struct Counters {
    next_ticket: u64,
    /// Released out of order, waiting for the tickets before them
    released: BTreeSet<u64>,
}

#[derive(Debug)]
struct Shared {
    counters: Mutex<Counters>,
    /// Lowest ticket not yet released
    serving: watch::Sender<u64>,
}

#[derive(Debug, Clone)]
pub struct DispatchSequencer {
    shared: Arc<Shared>,
}

impl Default for DispatchSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchSequencer {
    pub fn new() -> Self {
        let (serving, _rx) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                counters: Mutex::new(Counters::default()),
                serving,
            }),
        }
    }

    pub fn issue(&self) -> Ticket {
        let mut counters = self
            .shared
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let number = counters.next_ticket;
        counters.next_ticket += 1;
        Ticket {
            number,
            shared: self.shared.clone(),
            released: false,
        }
    }

    /// Lowest ticket still holding up the queue
    pub fn serving(&self) -> u64 {
        *self.shared.serving.borrow()
    }
}

/// A place in the dispatch queue
#[derive(Debug)]
pub struct Ticket {
    number: u64,
    shared: Arc<Shared>,
    released: bool,
}

impl Ticket {
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Wait until every earlier ticket is released
    pub async fn wait_turn(&self, cancel: &CancellationToken) -> Result<(), FailureReason> {
        let mut serving = self.shared.serving.subscribe();
        let number = self.number;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FailureReason::UserCancelled),
            ready = serving.wait_for(|current| *current >= number) => {
                ready.map(|_| ()).map_err(|_| FailureReason::UserCancelled)
            }
        }
    }

    /// Let later turns proceed
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut counters = self
            .shared
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        counters.released.insert(self.number);
        self.shared.serving.send_modify(|serving| {
            while counters.released.remove(serving) {
                *serving += 1;
            }
        });
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[tokio::test]
    async fn test_first_ticket_proceeds() {
        let sequencer = DispatchSequencer::new();
        let ticket = sequencer.issue();
        ticket.wait_turn(&CancellationToken::new()).await.unwrap();
    }

    #[test]
    fn test_later_ticket_waits_for_release() {
        let sequencer = DispatchSequencer::new();
        let mut first = sequencer.issue();
        let second = sequencer.issue();
        let cancel = CancellationToken::new();

        let mut waiting = task::spawn(second.wait_turn(&cancel));
        assert_pending!(waiting.poll());

        first.release();
        assert!(waiting.is_woken());
        assert_ready_eq!(waiting.poll(), Ok(()));
    }

    #[tokio::test]
    async fn test_out_of_order_release() {
        let sequencer = DispatchSequencer::new();
        let first = sequencer.issue();
        let second = sequencer.issue();
        let third = sequencer.issue();

        drop(second);
        assert_eq!(sequencer.serving(), 0);
        drop(first);
        assert_eq!(sequencer.serving(), 2);
        third.wait_turn(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let sequencer = DispatchSequencer::new();
        let _first = sequencer.issue();
        let second = sequencer.issue();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(second.wait_turn(&cancel).await, Err(FailureReason::UserCancelled));
    }
}
