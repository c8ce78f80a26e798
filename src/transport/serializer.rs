//! Outbound message queue that hands out acknowledged, MTU-sized chunks.
//!
//! One serializer exists per remote identifier. The chunk at the cursor stays
//! pending until [`MessageSerializer::ack_chunk_delivery`] is called, so a
//! failed or repeated pull returns the same bytes and the cursor only moves on
//! confirmed delivery.

use crate::transport::protocol::Message;
use crate::utils::Result;
use log::{debug, trace};
use std::collections::VecDeque;
use std::sync::Arc;

/// Chunk pulled from the queue, awaiting acknowledgement
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Sequence number of this chunk, unique per serializer
    pub seq: u64,
    /// Bytes to hand to the transport
    pub bytes: Vec<u8>,
    /// Message the chunk belongs to
    pub message: Arc<Message>,
}

/// Result of acknowledging a chunk
#[derive(Debug, Clone)]
pub struct DeliveryAck {
    /// Sequence number of the acknowledged chunk
    pub seq: u64,
    /// Message the chunk belonged to
    pub message: Arc<Message>,
    /// Fraction of the message now delivered
    pub progress: f32,
    /// Whether this chunk finished the message
    pub complete: bool,
}

#[derive(Debug)]
struct PendingChunk {
    seq: u64,
    bytes: Vec<u8>,
}

/// Per-identifier outbound queue
#[derive(Debug, Default)]
pub struct MessageSerializer {
    queue: VecDeque<Arc<Message>>,
    offset: u64,
    pending: Option<PendingChunk>,
    next_seq: u64,
}

impl MessageSerializer {
    /// Create an empty serializer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the end of the queue
    pub fn enqueue(&mut self, message: Arc<Message>) {
        debug!("Queued {} ({} waiting)", message, self.queue.len());
        self.queue.push_back(message);
    }

    /// Put a message ahead of everything not yet started.
    ///
    /// A head message that already has bytes on the wire keeps its place.
    pub fn enqueue_front(&mut self, message: Arc<Message>) {
        let position = usize::from(self.has_started());
        debug!("Queued {} at position {}", message, position);
        self.queue.insert(position.min(self.queue.len()), message);
    }

    fn has_started(&self) -> bool {
        !self.queue.is_empty() && (self.offset > 0 || self.pending.is_some())
    }

    /// Return the chunk at the cursor, at most `max_len` bytes.
    ///
    /// Repeated calls without an acknowledgement return the same chunk.
    pub fn get_next_chunk(&mut self, max_len: usize) -> Result<Option<Chunk>> {
        loop {
            let Some(message) = self.queue.front().cloned() else {
                return Ok(None);
            };

            if let Some(pending) = &self.pending {
                return Ok(Some(Chunk {
                    seq: pending.seq,
                    bytes: pending.bytes.clone(),
                    message,
                }));
            }

            match message.serialize(self.offset, max_len)? {
                Some(bytes) => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    trace!(
                        "Chunk {} of {}: {} bytes at offset {}",
                        seq,
                        message.id(),
                        bytes.len(),
                        self.offset
                    );
                    self.pending = Some(PendingChunk {
                        seq,
                        bytes: bytes.clone(),
                    });
                    return Ok(Some(Chunk {
                        seq,
                        bytes,
                        message,
                    }));
                }
                None => {
                    // Cursor already past the end: nothing left to send for it
                    self.queue.pop_front();
                    self.offset = 0;
                }
            }
        }
    }

    /// Confirm that chunk `seq` was delivered and advance the cursor.
    ///
    /// An acknowledgement for any chunk other than the pending one is ignored.
    pub fn ack_chunk_delivery(&mut self, seq: u64) -> Option<DeliveryAck> {
        if self.pending_seq() != Some(seq) {
            trace!("Ignoring acknowledgement for chunk {}", seq);
            return None;
        }
        let pending = self.pending.take()?;
        let message = self.queue.front().cloned()?;

        self.offset += pending.bytes.len() as u64;
        let total = message.total_length().unwrap_or(self.offset);
        let complete = self.offset >= total;
        let progress = if complete {
            1.0
        } else {
            (self.offset as f64 / total as f64).clamp(0.0, 1.0) as f32
        };

        if complete {
            self.queue.pop_front();
            self.offset = 0;
        }

        Some(DeliveryAck {
            seq: pending.seq,
            message,
            progress,
            complete,
        })
    }

    /// Forget partial progress; the head message restarts at offset zero
    pub fn rewind(&mut self) {
        if self.offset > 0 || self.pending.is_some() {
            debug!("Rewinding serializer at offset {}", self.offset);
        }
        self.offset = 0;
        self.pending = None;
    }

    /// Abandon the head message, e.g. after its body could not be read
    pub fn skip_current(&mut self) -> Option<Arc<Message>> {
        self.rewind();
        self.queue.pop_front()
    }

    /// Remove and return every queued message
    pub fn drain(&mut self) -> Vec<Arc<Message>> {
        self.rewind();
        self.queue.drain(..).collect()
    }

    /// Delivered fraction of the head message
    pub fn progress(&self) -> f32 {
        match self.queue.front() {
            Some(message) => {
                let total = message.total_length().unwrap_or(0);
                if total == 0 {
                    0.0
                } else {
                    (self.offset as f64 / total as f64).clamp(0.0, 1.0) as f32
                }
            }
            None => 0.0,
        }
    }

    /// Whether there is a chunk awaiting acknowledgement
    pub fn has_pending_chunk(&self) -> bool {
        self.pending.is_some()
    }

    /// Sequence number of the chunk awaiting acknowledgement
    pub fn pending_seq(&self) -> Option<u64> {
        self.pending.as_ref().map(|pending| pending.seq)
    }

    /// Whether `bytes` are exactly the chunk `seq` awaiting acknowledgement
    pub fn is_pending(&self, seq: u64, bytes: &[u8]) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|pending| pending.seq == seq && pending.bytes == bytes)
    }

    /// Message currently at the head of the queue
    pub fn current(&self) -> Option<&Arc<Message>> {
        self.queue.front()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
