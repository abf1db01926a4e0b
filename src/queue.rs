//! Bounded message queue shared by the link and its background tasks
//!
//! Capacity is fixed at construction. Three producer policies are offered:
//! - [`MessageQueue::overwrite`]: fast mode, the newest message replaces everything queued
//! - [`MessageQueue::try_push`]: reliable send, reject when full
//! - [`MessageQueue::push_evict_oldest`]: reliable receive, drop the oldest to make room
use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::contracts::Message;

/// Outcome of [`MessageQueue::push_evict_oldest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The oldest message was dropped to make room
    Evicted,
}

pub struct MessageQueue {
    items: Mutex<VecDeque<Message>>,
    capacity: usize,
    available: Notify,
}

impl MessageQueue {
    /// Create a queue; a zero capacity is raised to 1
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            available: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Replace whatever is queued with `msg`
    pub fn overwrite(&self, msg: Message) {
        {
            let mut items = self.items.lock();
            items.clear();
            items.push_back(msg);
        }
        self.available.notify_one();
    }

    /// Enqueue unless full; returns `false` when rejected
    pub fn try_push(&self, msg: Message) -> bool {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                return false;
            }
            items.push_back(msg);
        }
        self.available.notify_one();
        true
    }

    /// Enqueue, dropping the single oldest entry if the queue is full
    ///
    /// Never rejects: `msg` is always queued.
    pub fn push_evict_oldest(&self, msg: Message) -> PushOutcome {
        let outcome = {
            let mut items = self.items.lock();
            let outcome = if items.len() >= self.capacity {
                items.pop_front();
                PushOutcome::Evicted
            } else {
                PushOutcome::Queued
            };
            items.push_back(msg);
            outcome
        };
        self.available.notify_one();
        outcome
    }

    pub fn try_pop(&self) -> Option<Message> {
        self.items.lock().pop_front()
    }

    /// Pop, waiting at most `timeout` for a message to arrive
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Message> {
        if let Some(msg) = self.try_pop() {
            return Some(msg);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(msg) = self.try_pop() {
                return Some(msg);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{MessageType, NodeAddress, Payload};

    fn msg(tag: u8) -> Message {
        Message::data(NodeAddress::NULL, &Payload::new([tag, 0, 0, 0], [0.0; 5], 0))
    }

    fn tag(msg: Message) -> u8 {
        msg.payload().unwrap().id1
    }

    #[test]
    fn test_overwrite_keeps_only_latest() {
        let q = MessageQueue::new(1);
        q.overwrite(msg(1));
        q.overwrite(msg(2));
        assert_eq!(q.len(), 1);
        assert_eq!(tag(q.try_pop().unwrap()), 2);
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn test_reliable_fifo_order() {
        let q = MessageQueue::new(3);
        assert!(q.try_push(msg(1)));
        assert!(q.try_push(msg(2)));
        assert!(q.try_push(msg(3)));
        assert!(!q.try_push(msg(4)), "full queue must reject");

        let drained: Vec<u8> = std::iter::from_fn(|| q.try_pop()).map(tag).collect();
        assert_eq!(drained, vec![1, 2, 3]);
    }

    #[test]
    fn test_evict_oldest_on_overflow() {
        let q = MessageQueue::new(3);
        for i in 1..=3 {
            assert_eq!(q.push_evict_oldest(msg(i)), PushOutcome::Queued);
        }
        assert_eq!(q.push_evict_oldest(msg(4)), PushOutcome::Evicted);
        assert_eq!(q.len(), 3);

        let drained: Vec<u8> = std::iter::from_fn(|| q.try_pop()).map(tag).collect();
        assert_eq!(drained, vec![2, 3, 4]);
    }

    #[test]
    fn test_zero_capacity_raised() {
        let q = MessageQueue::new(0);
        assert_eq!(q.capacity(), 1);
        assert!(q.try_push(Message::system(MessageType::Heartbeat, NodeAddress::NULL)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_timeout_empty() {
        let q = MessageQueue::new(2);
        let started = tokio::time::Instant::now();
        assert!(q.pop_timeout(Duration::from_millis(5)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_timeout_wakes_on_push() {
        let q = std::sync::Arc::new(MessageQueue::new(2));
        let producer = q.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            producer.try_push(msg(7));
        });

        let got = q.pop_timeout(Duration::from_millis(50)).await;
        assert_eq!(got.map(tag), Some(7));
    }
}
