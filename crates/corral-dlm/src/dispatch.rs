//! Deferred AST dispatch.
//!
//! Blocking and completion callbacks run while the namespace structural
//! mutex is held; any outbound messages they produce are only *collected*
//! there. The batch is flushed by the public operation that produced it,
//! strictly after it has released the mutex, so no network send ever
//! happens under the lock and a second operation never observes a
//! half-flushed batch from the dispatching thread.

use corral_types::OutboundMessage;
use tracing::debug;

/// Ordered collection of outbound AST messages produced by one structural
/// operation.
#[derive(Debug, Default)]
pub(crate) struct AstBatch {
    messages: Vec<OutboundMessage>,
}

impl AstBatch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, msg: OutboundMessage) {
        self.messages.push(msg);
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub(crate) fn into_messages(self) -> Vec<OutboundMessage> {
        self.messages
    }
}

/// Transport used to transmit AST messages to remote peers.
///
/// Fire-and-forget from the lock manager's perspective: reply handling,
/// retries, and time-bounded waits are the transport's concern.
pub trait AstTransport: Send + Sync {
    fn send_request(&self, msg: OutboundMessage);
}

/// Transport that drops every message. Default for namespaces with no
/// remote peers (and for tests that assert on batches elsewhere).
#[derive(Debug, Clone, Copy)]
pub struct NoOpTransport;

impl AstTransport for NoOpTransport {
    #[inline(always)]
    fn send_request(&self, _msg: OutboundMessage) {}
}

/// Transport that records every message in order.
///
/// Used by tests and by embedders that drain messages into their own RPC
/// layer from a pump thread.
#[derive(Debug, Default)]
pub struct CollectingTransport {
    sent: parking_lot::Mutex<Vec<OutboundMessage>>,
}

impl CollectingTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything sent so far, in send order.
    #[must_use]
    pub fn drain(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.sent.lock())
    }

    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl AstTransport for CollectingTransport {
    fn send_request(&self, msg: OutboundMessage) {
        self.sent.lock().push(msg);
    }
}

/// Flush a batch through `transport`, preserving generation order.
pub(crate) fn flush(transport: &dyn AstTransport, batch: AstBatch) {
    if batch.is_empty() {
        return;
    }
    debug!(count = batch.len(), "flushing AST batch");
    for msg in batch.into_messages() {
        transport.send_request(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_types::{AstKind, LockFlags, LockHandle};

    fn msg(id: u64, kind: AstKind) -> OutboundMessage {
        OutboundMessage {
            target: LockHandle { id, cookie: 0 },
            kind,
            desc: None,
            flags: LockFlags::empty(),
        }
    }

    // -----------------------------------------------------------------------
    // test_flush_preserves_order
    // -----------------------------------------------------------------------

    #[test]
    fn test_flush_preserves_order() {
        let transport = CollectingTransport::new();
        let mut batch = AstBatch::new();
        batch.push(msg(1, AstKind::Blocking));
        batch.push(msg(2, AstKind::Completion));
        batch.push(msg(3, AstKind::Blocking));
        assert_eq!(batch.len(), 3);

        flush(&transport, batch);

        let sent = transport.drain();
        let ids: Vec<u64> = sent.iter().map(|m| m.target.id).collect();
        assert_eq!(ids, vec![1, 2, 3], "batch flushes in generation order");
        assert_eq!(transport.sent_count(), 0, "drain empties the transport");
    }
}
