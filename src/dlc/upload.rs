//! Per-transfer upload state machine
//!
//! Pure bookkeeping for one stop-and-wait chunked transfer. The phase is
//! an explicit tagged state so callers and tests can assert on it
//! directly. The coordinator drives the transitions; nothing here
//! touches the transport.

use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadPhase {
    /// Ready to send the next chunk.
    Idle,
    /// A chunk starting at `offset` is in flight, waiting for its ack.
    AwaitingAck { offset: usize },
    /// Every byte has been acknowledged.
    Done,
    Failed { reason: String },
}

#[derive(Debug)]
pub struct UploadSession {
    slot: usize,
    total: usize,
    chunk_size: usize,
    offset: usize,
    phase: UploadPhase,
}

impl UploadSession {
    pub fn new(slot: usize, total: usize, chunk_size: usize) -> Self {
        debug_assert!(chunk_size > 0);
        Self {
            slot,
            total,
            chunk_size,
            offset: 0,
            phase: if total == 0 {
                UploadPhase::Done
            } else {
                UploadPhase::Idle
            },
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn phase(&self) -> &UploadPhase {
        &self.phase
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn chunk_count(&self) -> usize {
        self.total.div_ceil(self.chunk_size)
    }

    /// Byte range of the next chunk to send, if the machine is `Idle`.
    pub fn next_chunk(&self) -> Option<Range<usize>> {
        if self.phase != UploadPhase::Idle {
            return None;
        }
        let end = (self.offset + self.chunk_size).min(self.total);
        (self.offset < end).then_some(self.offset..end)
    }

    /// The chunk returned by `next_chunk` went out on the wire.
    pub fn mark_sent(&mut self) {
        if self.phase == UploadPhase::Idle {
            self.phase = UploadPhase::AwaitingAck {
                offset: self.offset,
            };
        }
    }

    /// The in-flight chunk was acknowledged; advance past it.
    pub fn mark_acked(&mut self) {
        if let UploadPhase::AwaitingAck { offset } = self.phase {
            let end = (offset + self.chunk_size).min(self.total);
            self.offset = end;
            self.phase = if self.offset >= self.total {
                UploadPhase::Done
            } else {
                UploadPhase::Idle
            };
        }
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.phase = UploadPhase::Failed {
            reason: reason.into(),
        };
    }

    pub fn is_done(&self) -> bool {
        self.phase == UploadPhase::Done
    }
}
