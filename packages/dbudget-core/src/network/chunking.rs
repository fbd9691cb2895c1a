//! # Chunked Framing
//!
//! Data channels cap the size of one message, so every encoded
//! [`PeerMessage`](super::protocol::PeerMessage) travels as one or more
//! chunks.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         CHUNKED TRANSFER                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  message bytes (total_length = L)                                      │
//! │  ┌──────────────┬──────────────┬──────────────┬─────────┐              │
//! │  │ [0, s)       │ [s, 2s)      │ [2s, 3s)     │ [3s, L) │              │
//! │  └──────┬───────┴──────┬───────┴──────┬───────┴────┬────┘              │
//! │         ▼              ▼              ▼            ▼                    │
//! │  Chunk{transfer_id, kind, index=offset, total_length=L, sender, bytes} │
//! │                                                                         │
//! │  Receiver (one Reassembler per connection):                            │
//! │  • keyed by byte offset, so arrival order does not matter              │
//! │  • new transfer_id          → drop partial buffer, start over          │
//! │  • same id, new length      → Supersede: start over                    │
//! │                               Strict:    TransferMismatch              │
//! │  • same offset again        → ignored                                  │
//! │  • overlap / out of range   → TransferMismatch                         │
//! │  • received == total_length → concatenate by offset, reset             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Lost chunks are not retransmitted. A transfer missing a chunk stays
//! pending until a newer transfer replaces it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::protocol::{MessageKind, MAX_DEVICE_NAME_LEN};
use super::transport::PeerTransport;
use crate::config::ReassemblyPolicy;
use crate::error::{Error, Result};

// ============================================================================
// CHUNK
// ============================================================================

/// One framed piece of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Shared by every chunk of one send
    pub transfer_id: Uuid,
    /// Kind of the message being carried
    pub kind: MessageKind,
    /// Byte offset of `payload` within the message
    pub index: u64,
    /// Length of the whole message
    pub total_length: u64,
    /// Display name of the sending device
    pub sender_device_name: String,
    /// `[index, index + payload.len())` of the message
    pub payload: Vec<u8>,
}

impl Chunk {
    /// Encode for the data channel
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode one data-channel frame
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let chunk: Chunk = bincode::deserialize(bytes)
            .map_err(|e| Error::InvalidMessage(format!("undecodable chunk: {}", e)))?;
        if chunk.sender_device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(Error::InvalidMessage("chunk sender name too long".into()));
        }
        Ok(chunk)
    }

    /// Exclusive end offset, if it fits in the declared length
    fn end(&self) -> Option<u64> {
        self.index
            .checked_add(self.payload.len() as u64)
            .filter(|end| *end <= self.total_length)
    }
}

/// Split `data` into chunks of at most `chunk_size` bytes under a fresh
/// transfer id. Empty data still produces one (empty) chunk.
pub fn split_message(
    data: &[u8],
    chunk_size: usize,
    kind: MessageKind,
    sender_device_name: &str,
) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(Error::InvalidConfig("chunk size must be > 0".into()));
    }

    let transfer_id = Uuid::new_v4();
    let total_length = data.len() as u64;
    let make = |index: usize, payload: &[u8]| Chunk {
        transfer_id,
        kind,
        index: index as u64,
        total_length,
        sender_device_name: sender_device_name.to_string(),
        payload: payload.to_vec(),
    };

    if data.is_empty() {
        return Ok(vec![make(0, &[])]);
    }

    Ok(data
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, window)| make(i * chunk_size, window))
        .collect())
}

/// Summary of one chunked send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentTransfer {
    /// Transfer id stamped on every chunk
    pub transfer_id: Uuid,
    /// Number of chunks written
    pub chunks: usize,
}

/// Split `data` and write every chunk to `transport` as its own frame
pub fn send_chunky(
    transport: &dyn PeerTransport,
    data: &[u8],
    kind: MessageKind,
    sender_device_name: &str,
    chunk_size: usize,
) -> Result<SentTransfer> {
    let chunks = split_message(data, chunk_size, kind, sender_device_name)?;
    let transfer_id = chunks
        .first()
        .map(|c| c.transfer_id)
        .ok_or_else(|| Error::Internal("split produced no chunks".into()))?;

    for chunk in &chunks {
        transport.send(chunk.encode()?)?;
    }

    #[cfg(feature = "verbose-logging")]
    tracing::debug!(%transfer_id, %kind, chunks = chunks.len(), bytes = data.len(), "Sent chunked message");

    Ok(SentTransfer {
        transfer_id,
        chunks: chunks.len(),
    })
}

// ============================================================================
// REASSEMBLY
// ============================================================================

/// A fully received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    /// Transfer id
    pub transfer_id: Uuid,
    /// Kind declared in the chunk headers
    pub kind: MessageKind,
    /// Sender name from the chunk headers
    pub sender_device_name: String,
    /// The reassembled message bytes
    pub data: Vec<u8>,
}

/// Outcome of feeding one chunk to the reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// Stored; more bytes outstanding
    Pending {
        /// Bytes buffered so far
        received: u64,
        /// Declared total
        total: u64,
    },
    /// Same offset already buffered; nothing changed
    Duplicate,
    /// Last missing piece arrived
    Complete(CompletedTransfer),
}

#[derive(Debug)]
struct InFlight {
    transfer_id: Uuid,
    kind: MessageKind,
    total_length: u64,
    received: u64,
    chunks: BTreeMap<u64, Vec<u8>>,
}

impl InFlight {
    fn start(chunk: &Chunk) -> Self {
        Self {
            transfer_id: chunk.transfer_id,
            kind: chunk.kind,
            total_length: chunk.total_length,
            received: 0,
            chunks: BTreeMap::new(),
        }
    }
}

/// Per-connection reassembly state
#[derive(Debug)]
pub struct Reassembler {
    policy: ReassemblyPolicy,
    max_message_size: u64,
    current: Option<InFlight>,
}

impl Reassembler {
    /// New reassembler with the given interleaving policy
    pub fn new(policy: ReassemblyPolicy, max_message_size: usize) -> Self {
        Self {
            policy,
            max_message_size: max_message_size as u64,
            current: None,
        }
    }

    /// `(transfer_id, received, total)` of the transfer in progress
    pub fn in_progress(&self) -> Option<(Uuid, u64, u64)> {
        self.current
            .as_ref()
            .map(|t| (t.transfer_id, t.received, t.total_length))
    }

    /// Drop any partial buffer
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Feed one chunk
    pub fn accept(&mut self, chunk: Chunk) -> Result<Reassembly> {
        if chunk.total_length > self.max_message_size {
            return Err(Error::InvalidMessage(format!(
                "declared length {} exceeds limit {}",
                chunk.total_length, self.max_message_size
            )));
        }
        let end = chunk.end().ok_or_else(|| {
            Error::TransferMismatch(format!(
                "chunk [{}, +{}) outside declared length {}",
                chunk.index,
                chunk.payload.len(),
                chunk.total_length
            ))
        })?;
        if chunk.payload.is_empty() && chunk.total_length > 0 {
            return Err(Error::TransferMismatch("empty chunk in non-empty transfer".into()));
        }

        self.select_transfer(&chunk)?;
        let transfer = self.current.get_or_insert_with(|| InFlight::start(&chunk));

        if let Some((&start, existing)) = transfer.chunks.range(..=chunk.index).next_back() {
            if start == chunk.index && existing.len() == chunk.payload.len() {
                return Ok(Reassembly::Duplicate);
            }
            if start + existing.len() as u64 > chunk.index {
                self.current = None;
                return Err(Error::TransferMismatch(format!(
                    "chunk at {} overlaps chunk at {}",
                    chunk.index, start
                )));
            }
        }
        if let Some((&next, _)) = transfer.chunks.range(chunk.index + 1..).next() {
            if next < end {
                self.current = None;
                return Err(Error::TransferMismatch(format!(
                    "chunk at {} overlaps chunk at {}",
                    chunk.index, next
                )));
            }
        }

        transfer.received += chunk.payload.len() as u64;
        transfer.chunks.insert(chunk.index, chunk.payload);

        if transfer.received < transfer.total_length {
            return Ok(Reassembly::Pending {
                received: transfer.received,
                total: transfer.total_length,
            });
        }

        let Some(done) = self.current.take() else {
            return Err(Error::Internal("transfer vanished during completion".into()));
        };
        let mut data = Vec::with_capacity(done.total_length as usize);
        for (_, piece) in done.chunks {
            data.extend_from_slice(&piece);
        }

        Ok(Reassembly::Complete(CompletedTransfer {
            transfer_id: done.transfer_id,
            kind: done.kind,
            sender_device_name: chunk.sender_device_name,
            data,
        }))
    }

    /// Apply the interleaving policy before buffering `chunk`
    fn select_transfer(&mut self, chunk: &Chunk) -> Result<()> {
        let Some(current) = self.current.as_ref() else {
            return Ok(());
        };

        if current.transfer_id != chunk.transfer_id {
            tracing::debug!(
                old = %current.transfer_id,
                new = %chunk.transfer_id,
                discarded = current.received,
                "New transfer supersedes incomplete one"
            );
            self.current = None;
            return Ok(());
        }

        if current.total_length != chunk.total_length || current.kind != chunk.kind {
            match self.policy {
                ReassemblyPolicy::Supersede => {
                    tracing::debug!(
                        transfer_id = %chunk.transfer_id,
                        was = current.total_length,
                        now = chunk.total_length,
                        "Declared length changed, restarting transfer"
                    );
                    self.current = None;
                }
                ReassemblyPolicy::Strict => {
                    let was = current.total_length;
                    self.current = None;
                    return Err(Error::TransferMismatch(format!(
                        "transfer {} declared {} bytes, then {}",
                        chunk.transfer_id, was, chunk.total_length
                    )));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024 * 1024;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn reassemble(chunks: Vec<Chunk>) -> Vec<u8> {
        let mut r = Reassembler::new(ReassemblyPolicy::Supersede, MAX);
        let mut out = None;
        for chunk in chunks {
            if let Reassembly::Complete(done) = r.accept(chunk).unwrap() {
                assert!(out.is_none(), "completed twice");
                out = Some(done.data);
            }
        }
        out.expect("transfer did not complete")
    }

    #[test]
    fn test_split_offsets_tile_message() {
        let data = payload(1000);
        let chunks = split_message(&data, 300, MessageKind::Transactions, "a").unwrap();

        assert_eq!(chunks.len(), 4);
        let offsets: Vec<u64> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(offsets, vec![0, 300, 600, 900]);
        assert_eq!(chunks[3].payload.len(), 100);
        assert!(chunks.iter().all(|c| c.total_length == 1000));
        assert!(chunks.iter().all(|c| c.transfer_id == chunks[0].transfer_id));
    }

    #[test]
    fn test_split_fresh_transfer_ids() {
        let a = split_message(b"x", 8, MessageKind::Hello, "a").unwrap();
        let b = split_message(b"x", 8, MessageKind::Hello, "a").unwrap();
        assert_ne!(a[0].transfer_id, b[0].transfer_id);
    }

    #[test]
    fn test_split_zero_chunk_size() {
        assert!(split_message(b"x", 0, MessageKind::Hello, "a").is_err());
    }

    #[test]
    fn test_reassembly_in_order() {
        for (len, size) in [(1, 1), (10, 3), (1000, 128), (4096, 4096), (5000, 7)] {
            let data = payload(len);
            let chunks = split_message(&data, size, MessageKind::Transactions, "a").unwrap();
            assert_eq!(reassemble(chunks), data, "len {} size {}", len, size);
        }
    }

    #[test]
    fn test_reassembly_any_arrival_order() {
        let data = payload(1000);
        let chunks = split_message(&data, 100, MessageKind::Transactions, "a").unwrap();

        let mut reversed = chunks.clone();
        reversed.reverse();
        assert_eq!(reassemble(reversed), data);

        // interleave evens then odds
        let shuffled: Vec<Chunk> = chunks
            .iter()
            .step_by(2)
            .chain(chunks.iter().skip(1).step_by(2))
            .cloned()
            .collect();
        assert_eq!(reassemble(shuffled), data);

        // rotate
        let mut rotated = chunks;
        rotated.rotate_left(7);
        assert_eq!(reassemble(rotated), data);
    }

    #[test]
    fn test_empty_message() {
        let chunks = split_message(b"", 16, MessageKind::BackedUpTransactions, "a").unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(reassemble(chunks), Vec::<u8>::new());
    }

    #[test]
    fn test_completion_resets_state() {
        let mut r = Reassembler::new(ReassemblyPolicy::Supersede, MAX);
        for chunk in split_message(&payload(10), 4, MessageKind::Transactions, "a").unwrap() {
            r.accept(chunk).unwrap();
        }
        assert!(r.in_progress().is_none());
    }

    #[test]
    fn test_new_transfer_discards_partial() {
        let mut r = Reassembler::new(ReassemblyPolicy::Supersede, MAX);
        let first = split_message(&payload(100), 10, MessageKind::Transactions, "a").unwrap();
        let second_data = vec![7u8; 30];
        let second = split_message(&second_data, 10, MessageKind::Transactions, "a").unwrap();

        r.accept(first[0].clone()).unwrap();
        r.accept(first[1].clone()).unwrap();
        assert_eq!(r.in_progress().map(|p| p.1), Some(20));

        let progress = r.accept(second[0].clone()).unwrap();
        assert_eq!(progress, Reassembly::Pending { received: 10, total: 30 });
        assert_eq!(r.in_progress().map(|p| p.0), Some(second[0].transfer_id));

        r.accept(second[1].clone()).unwrap();
        let done = r.accept(second[2].clone()).unwrap();
        match done {
            Reassembly::Complete(t) => assert_eq!(t.data, second_data),
            other => panic!("expected completion, got {:?}", other),
        }

        // stale chunk of the abandoned transfer starts a fresh buffer, not a merge
        let progress = r.accept(first[2].clone()).unwrap();
        assert_eq!(progress, Reassembly::Pending { received: 10, total: 100 });
    }

    #[test]
    fn test_length_change_supersedes() {
        let mut r = Reassembler::new(ReassemblyPolicy::Supersede, MAX);
        let mut chunks = split_message(&payload(40), 10, MessageKind::Transactions, "a").unwrap();
        r.accept(chunks[0].clone()).unwrap();

        chunks[1].total_length = 20;
        let progress = r.accept(chunks[1].clone()).unwrap();
        assert_eq!(progress, Reassembly::Pending { received: 10, total: 20 });
    }

    #[test]
    fn test_length_change_strict_fails() {
        let mut r = Reassembler::new(ReassemblyPolicy::Strict, MAX);
        let mut chunks = split_message(&payload(40), 10, MessageKind::Transactions, "a").unwrap();
        r.accept(chunks[0].clone()).unwrap();

        chunks[1].total_length = 20;
        let result = r.accept(chunks[1].clone());
        assert!(matches!(result, Err(Error::TransferMismatch(_))));
        assert!(r.in_progress().is_none());
    }

    #[test]
    fn test_strict_still_supersedes_on_new_transfer_id() {
        let mut r = Reassembler::new(ReassemblyPolicy::Strict, MAX);
        let a = split_message(&payload(40), 10, MessageKind::Transactions, "a").unwrap();
        let b = split_message(&payload(15), 10, MessageKind::Transactions, "a").unwrap();
        r.accept(a[0].clone()).unwrap();
        assert!(r.accept(b[0].clone()).is_ok());
    }

    #[test]
    fn test_duplicate_chunk_ignored() {
        let mut r = Reassembler::new(ReassemblyPolicy::Supersede, MAX);
        let chunks = split_message(&payload(30), 10, MessageKind::Transactions, "a").unwrap();
        r.accept(chunks[0].clone()).unwrap();

        assert_eq!(r.accept(chunks[0].clone()).unwrap(), Reassembly::Duplicate);
        assert_eq!(r.in_progress().map(|p| p.1), Some(10));
    }

    #[test]
    fn test_overlap_is_mismatch() {
        let mut r = Reassembler::new(ReassemblyPolicy::Supersede, MAX);
        let chunks = split_message(&payload(30), 10, MessageKind::Transactions, "a").unwrap();
        r.accept(chunks[0].clone()).unwrap();

        let mut overlapping = chunks[1].clone();
        overlapping.index = 5;
        assert!(matches!(r.accept(overlapping), Err(Error::TransferMismatch(_))));
        assert!(r.in_progress().is_none());
    }

    #[test]
    fn test_out_of_range_is_mismatch() {
        let mut r = Reassembler::new(ReassemblyPolicy::Supersede, MAX);
        let mut chunk = split_message(&payload(30), 10, MessageKind::Transactions, "a").unwrap()[2].clone();
        chunk.index = 25;
        assert!(matches!(r.accept(chunk), Err(Error::TransferMismatch(_))));
    }

    #[test]
    fn test_oversized_declaration_rejected() {
        let mut r = Reassembler::new(ReassemblyPolicy::Supersede, 100);
        let chunk = split_message(&payload(200), 50, MessageKind::Transactions, "a").unwrap()[0].clone();
        assert!(matches!(r.accept(chunk), Err(Error::InvalidMessage(_))));
    }

    #[test]
    fn test_chunk_encode_decode() {
        let chunk = split_message(b"hello", 2, MessageKind::Hello, "phone").unwrap()[1].clone();
        let decoded = Chunk::decode(&chunk.encode().unwrap()).unwrap();
        assert_eq!(decoded, chunk);
        assert!(matches!(Chunk::decode(&[1, 2, 3]), Err(Error::InvalidMessage(_))));
    }
}
