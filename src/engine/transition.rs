use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;

use crate::engine::flow::{FlowProto, FlowToken};

/// A query parked while the engine is in Transition.
#[derive(Debug, Clone)]
pub struct QueuedQuery {
    pub token: FlowToken,
    pub data: Bytes,
    pub client: SocketAddr,
    pub proto: FlowProto,
    pub enqueued_at: Instant,
}

/// Bounded FIFO of queries received during Transition. On overflow the
/// oldest entry is dropped and handed back so the caller can log it.
#[derive(Debug)]
pub struct TransitionQueue {
    queue: VecDeque<QueuedQuery>,
    capacity: usize,
}

impl TransitionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Enqueue, returning the dropped oldest entry when full.
    pub fn enqueue(&mut self, query: QueuedQuery) -> Option<QueuedQuery> {
        let dropped = if self.queue.len() >= self.capacity {
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(query);
        dropped
    }

    /// Remove every queued entry in FIFO order.
    pub fn drain(&mut self) -> Vec<QueuedQuery> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(marker: u8) -> QueuedQuery {
        QueuedQuery {
            token: FlowToken {
                id: marker as u64,
                generation: 1,
            },
            data: Bytes::copy_from_slice(&[marker]),
            client: "127.0.0.1:5353".parse().unwrap(),
            proto: FlowProto::Udp,
            enqueued_at: Instant::now(),
        }
    }

    #[test]
    fn fifo_order() {
        let mut queue = TransitionQueue::new(10);
        for marker in 0..3 {
            assert!(queue.enqueue(query(marker)).is_none());
        }
        let drained = queue.drain();
        let markers: Vec<u8> = drained.iter().map(|q| q.data[0]).collect();
        assert_eq!(markers, vec![0, 1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut queue = TransitionQueue::new(3);
        for marker in 0..3 {
            assert!(queue.enqueue(query(marker)).is_none());
        }
        let dropped = queue.enqueue(query(3)).expect("oldest entry is dropped");
        assert_eq!(dropped.data[0], 0);
        assert_eq!(queue.len(), 3);
        let markers: Vec<u8> = queue.drain().iter().map(|q| q.data[0]).collect();
        assert_eq!(markers, vec![1, 2, 3]);
    }
}
