// Completed iterations waiting to be clustered.
//
// Iterations are queued as they complete and drained in FIFO order by the owner of the clusterer.
// Enqueueing only needs a shared reference so that the thread that completes an iteration does
// not have to own the clusterer.

use crate::profile::NodeId;

use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Default)]
pub struct ClusterQueue {
    items: Mutex<VecDeque<NodeId>>,
}

impl ClusterQueue {
    pub fn new() -> ClusterQueue {
        ClusterQueue::default()
    }

    pub fn push(&self, iteration: NodeId) {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(iteration);
    }

    pub fn pop(&self) -> Option<NodeId> {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[test]
fn test_fifo() {
    let q = ClusterQueue::new();
    assert!(q.is_empty());
    q.push(NodeId(3));
    q.push(NodeId(1));
    q.push(NodeId(2));
    assert!(q.len() == 3);
    assert!(q.pop() == Some(NodeId(3)));
    assert!(q.pop() == Some(NodeId(1)));
    q.push(NodeId(7));
    assert!(q.pop() == Some(NodeId(2)));
    assert!(q.pop() == Some(NodeId(7)));
    assert!(q.pop().is_none());
}

#[test]
fn test_shared_push() {
    let q = ClusterQueue::new();
    std::thread::scope(|s| {
        for t in 0..4 {
            let q = &q;
            s.spawn(move || {
                for i in 0..10 {
                    q.push(NodeId(t * 10 + i));
                }
            });
        }
    });
    assert!(q.len() == 40);
}
