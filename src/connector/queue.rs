//! Outgoing message queue

use bytes::Bytes;
use std::collections::VecDeque;

/// A message waiting to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl OutgoingMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// FIFO of messages not yet published.
///
/// Only the driver removes messages, and only after a successful publish, so
/// the head seen by [`OutgoingQueue::peek`] is still the head when
/// [`OutgoingQueue::pop`] is called.
#[derive(Debug, Default)]
pub struct OutgoingQueue {
    messages: VecDeque<OutgoingMessage>,
}

impl OutgoingQueue {
    pub fn push(&mut self, message: OutgoingMessage) {
        self.messages.push_back(message);
    }

    /// Copy of the head message. Payloads are reference counted.
    pub fn peek(&self) -> Option<OutgoingMessage> {
        self.messages.front().cloned()
    }

    pub fn pop(&mut self) -> Option<OutgoingMessage> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = OutgoingQueue::default();
        queue.push(OutgoingMessage::new("a", "1"));
        queue.push(OutgoingMessage::new("b", "2"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().topic, "a");
        assert_eq!(queue.pop().unwrap().topic, "b");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_peek_does_not_remove() {
        let mut queue = OutgoingQueue::default();
        queue.push(OutgoingMessage::new("a", Bytes::from_static(b"payload")));

        let head = queue.peek().unwrap();
        assert_eq!(head.payload, Bytes::from_static(b"payload"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek(), Some(head));
    }

    #[test]
    fn test_empty_queue() {
        let queue = OutgoingQueue::default();
        assert!(queue.is_empty());
        assert!(queue.peek().is_none());
    }
}
