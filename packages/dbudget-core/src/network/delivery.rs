//! # Counted Delivery
//!
//! Data channels give no delivery receipt, so a sender cannot tell when a
//! ledger has fully arrived. The receiver answers every `transactions`
//! chunk with a `transactionConfirmation{transfer_id, index}`. The sender
//! counts them and sends `finishedSendingTransactions` only when
//! `received_confirmations == sent_chunks` for the whole round.
//!
//! ```text
//! begin() ─► record_sent(t1) ─► record_sent(t2) ─► seal()
//!                                                    │
//!            confirm(t1, 0) … confirm(t2, k) ────────┴─► AllConfirmed
//! ```

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use super::chunking::SentTransfer;
use crate::error::{Error, Result};

/// Result of recording one confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Counted, more outstanding
    Counted,
    /// Already counted earlier
    Duplicate,
    /// Last outstanding confirmation; the round is finished
    AllConfirmed,
}

#[derive(Debug, Default)]
struct Receipt {
    expected: usize,
    confirmed: HashSet<u64>,
}

/// Sender-side confirmation counter for one peer
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    round: u64,
    active: bool,
    sealed: bool,
    transfers: HashMap<Uuid, Receipt>,
    sent_chunks: usize,
    received_confirmations: usize,
}

impl DeliveryTracker {
    /// Idle tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new round, replacing any unfinished one. Returns the round id.
    pub fn begin(&mut self) -> u64 {
        if self.active {
            tracing::debug!(
                round = self.round,
                sent = self.sent_chunks,
                confirmed = self.received_confirmations,
                "Abandoning unfinished delivery round"
            );
        }
        self.clear();
        self.round += 1;
        self.active = true;
        self.round
    }

    /// Count the chunks of one send
    pub fn record_sent(&mut self, sent: SentTransfer) {
        if !self.active || self.sealed {
            return;
        }
        self.sent_chunks += sent.chunks;
        self.transfers.entry(sent.transfer_id).or_default().expected += sent.chunks;
    }

    /// No more sends in this round. Returns `true` if every confirmation
    /// is already in.
    pub fn seal(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.sealed = true;
        self.finish_if_complete()
    }

    /// Record a confirmation from the peer
    pub fn confirm(&mut self, transfer_id: Uuid, index: u64) -> Result<Confirmation> {
        let receipt = self.transfers.get_mut(&transfer_id).ok_or_else(|| {
            Error::InvalidMessage(format!("confirmation for unknown transfer {}", transfer_id))
        })?;

        if receipt.confirmed.len() >= receipt.expected && !receipt.confirmed.contains(&index) {
            return Err(Error::InvalidMessage(format!(
                "more confirmations than chunks for transfer {}",
                transfer_id
            )));
        }
        if !receipt.confirmed.insert(index) {
            return Ok(Confirmation::Duplicate);
        }
        self.received_confirmations += 1;

        if self.finish_if_complete() {
            Ok(Confirmation::AllConfirmed)
        } else {
            Ok(Confirmation::Counted)
        }
    }

    /// Whether a round is in progress
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Id of the latest round
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Chunks sent in the current round
    pub fn sent_chunks(&self) -> usize {
        self.sent_chunks
    }

    /// Confirmations received in the current round
    pub fn received_confirmations(&self) -> usize {
        self.received_confirmations
    }

    /// Give up on the current round
    pub fn reset(&mut self) {
        self.clear();
    }

    fn finish_if_complete(&mut self) -> bool {
        if self.active && self.sealed && self.received_confirmations == self.sent_chunks {
            self.clear();
            return true;
        }
        false
    }

    fn clear(&mut self) {
        self.active = false;
        self.sealed = false;
        self.transfers.clear();
        self.sent_chunks = 0;
        self.received_confirmations = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sent(chunks: usize) -> SentTransfer {
        SentTransfer {
            transfer_id: Uuid::new_v4(),
            chunks,
        }
    }

    #[test]
    fn test_finishes_after_all_confirmations() {
        let mut tracker = DeliveryTracker::new();
        tracker.begin();
        let t = sent(3);
        tracker.record_sent(t);
        assert!(!tracker.seal());

        assert_eq!(tracker.confirm(t.transfer_id, 0).unwrap(), Confirmation::Counted);
        assert_eq!(tracker.confirm(t.transfer_id, 100).unwrap(), Confirmation::Counted);
        assert_eq!(tracker.received_confirmations(), 2);
        assert_eq!(
            tracker.confirm(t.transfer_id, 200).unwrap(),
            Confirmation::AllConfirmed
        );
        assert!(!tracker.is_active());
    }

    #[test]
    fn test_not_finished_before_seal() {
        let mut tracker = DeliveryTracker::new();
        tracker.begin();
        let t = sent(1);
        tracker.record_sent(t);

        // a fast receiver may confirm before the sender seals the round
        assert_eq!(tracker.confirm(t.transfer_id, 0).unwrap(), Confirmation::Counted);
        assert!(tracker.seal());
    }

    #[test]
    fn test_counts_across_transfers() {
        let mut tracker = DeliveryTracker::new();
        tracker.begin();
        let a = sent(2);
        let b = sent(1);
        tracker.record_sent(a);
        tracker.record_sent(b);
        tracker.seal();
        assert_eq!(tracker.sent_chunks(), 3);

        tracker.confirm(a.transfer_id, 0).unwrap();
        tracker.confirm(b.transfer_id, 0).unwrap();
        assert_eq!(tracker.confirm(a.transfer_id, 10).unwrap(), Confirmation::AllConfirmed);
    }

    #[test]
    fn test_duplicate_confirmation_not_counted() {
        let mut tracker = DeliveryTracker::new();
        tracker.begin();
        let t = sent(2);
        tracker.record_sent(t);
        tracker.seal();

        tracker.confirm(t.transfer_id, 0).unwrap();
        assert_eq!(tracker.confirm(t.transfer_id, 0).unwrap(), Confirmation::Duplicate);
        assert_eq!(tracker.received_confirmations(), 1);
    }

    #[test]
    fn test_unknown_transfer_rejected() {
        let mut tracker = DeliveryTracker::new();
        tracker.begin();
        tracker.record_sent(sent(1));
        assert!(matches!(
            tracker.confirm(Uuid::new_v4(), 0),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_excess_confirmations_rejected() {
        let mut tracker = DeliveryTracker::new();
        tracker.begin();
        let t = sent(1);
        tracker.record_sent(t);

        tracker.confirm(t.transfer_id, 0).unwrap();
        assert!(tracker.confirm(t.transfer_id, 99).is_err());
    }

    #[test]
    fn test_begin_replaces_round() {
        let mut tracker = DeliveryTracker::new();
        let first = tracker.begin();
        let old = sent(5);
        tracker.record_sent(old);

        let second = tracker.begin();
        assert!(second > first);
        assert_eq!(tracker.sent_chunks(), 0);
        assert!(tracker.confirm(old.transfer_id, 0).is_err());
    }

    #[test]
    fn test_reset() {
        let mut tracker = DeliveryTracker::new();
        tracker.begin();
        tracker.record_sent(sent(2));
        tracker.reset();
        assert!(!tracker.is_active());
        assert!(!tracker.seal());
    }
}
