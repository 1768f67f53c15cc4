use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lambda_live_proto::Invocation;
use tokio::sync::oneshot;

/// Result of asking for the next invocation of a worker.
#[derive(Debug)]
pub enum Next {
    Ready(Invocation),
    /// Resolves when an invocation is delivered. Fails if the waiter is
    /// discarded first.
    Waiting(oneshot::Receiver<Invocation>),
}

#[derive(Default)]
struct QueueState {
    queued: HashMap<String, VecDeque<Invocation>>,
    waiting: HashMap<String, oneshot::Sender<Invocation>>,
}

/// Per-worker hand-off between delivered invocations and the workers'
/// long polls.
///
/// For any worker id at most one of the queue and the waiter is non-empty.
#[derive(Clone, Default)]
pub struct InvocationQueue {
    inner: Arc<Mutex<QueueState>>,
}

impl InvocationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliver(&self, invocation: Invocation) {
        let mut state = self.lock();
        let invocation = match state.waiting.remove(&invocation.worker_id) {
            Some(waiter) => match waiter.send(invocation) {
                Ok(()) => return,
                // The long poll went away; keep it for the next one.
                Err(invocation) => invocation,
            },
            None => invocation,
        };
        state
            .queued
            .entry(invocation.worker_id.clone())
            .or_default()
            .push_back(invocation);
    }

    /// Pops the oldest queued invocation, or registers a waiter replacing any
    /// previous one for the same worker.
    pub fn next(&self, worker_id: &str) -> Next {
        let mut state = self.lock();
        if let Some(queue) = state.queued.get_mut(worker_id) {
            let invocation = queue.pop_front();
            if queue.is_empty() {
                state.queued.remove(worker_id);
            }
            if let Some(invocation) = invocation {
                return Next::Ready(invocation);
            }
        }

        let (tx, rx) = oneshot::channel();
        state.waiting.insert(worker_id.to_string(), tx);
        Next::Waiting(rx)
    }

    pub fn remove_waiter(&self, worker_id: &str) -> bool {
        self.lock().waiting.remove(worker_id).is_some()
    }

    /// Discards every waiter so pending long polls complete.
    pub fn close_all(&self) {
        self.lock().waiting.clear();
    }

    pub fn queued_len(&self, worker_id: &str) -> usize {
        self.lock().queued.get(worker_id).map_or(0, VecDeque::len)
    }

    pub fn is_waiting(&self, worker_id: &str) -> bool {
        self.lock().waiting.contains_key(worker_id)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use lambda_live_proto::InvocationContext;
    use serde_json::json;

    use super::*;

    fn invocation(worker_id: &str, request_id: &str) -> Invocation {
        Invocation {
            worker_id: worker_id.into(),
            function_id: "api".into(),
            request_id: request_id.into(),
            deadline: 3000,
            event: json!({"n": request_id}),
            context: InvocationContext::default(),
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn waiter_registered_first_resolves_once() {
        let queue = InvocationQueue::new();
        let Next::Waiting(rx) = queue.next("w1") else {
            panic!("nothing should be queued");
        };
        assert!(queue.is_waiting("w1"));

        queue.deliver(invocation("w1", "r1"));

        assert_eq!(rx.await.unwrap().request_id, "r1");
        assert!(!queue.is_waiting("w1"));
        assert_eq!(queue.queued_len("w1"), 0);
    }

    #[test]
    fn queued_invocations_are_returned_in_order() {
        let queue = InvocationQueue::new();
        queue.deliver(invocation("w1", "r1"));
        queue.deliver(invocation("w1", "r2"));
        queue.deliver(invocation("w2", "r3"));

        for expected in ["r1", "r2"] {
            match queue.next("w1") {
                Next::Ready(inv) => assert_eq!(inv.request_id, expected),
                Next::Waiting(_) => panic!("expected a queued invocation"),
            }
        }
        assert!(matches!(queue.next("w1"), Next::Waiting(_)));
        assert_eq!(queue.queued_len("w2"), 1);
    }

    #[test]
    fn abandoned_waiter_does_not_lose_the_invocation() {
        let queue = InvocationQueue::new();
        drop(queue.next("w1"));

        queue.deliver(invocation("w1", "r1"));

        assert!(!queue.is_waiting("w1"));
        assert_eq!(queue.queued_len("w1"), 1);
    }

    #[tokio::test]
    async fn removed_waiters_fail_their_long_poll() {
        let queue = InvocationQueue::new();
        let Next::Waiting(first) = queue.next("w1") else {
            panic!("nothing should be queued");
        };
        let Next::Waiting(second) = queue.next("w2") else {
            panic!("nothing should be queued");
        };

        assert!(queue.remove_waiter("w1"));
        assert!(!queue.remove_waiter("w1"));
        queue.close_all();

        assert!(first.await.is_err());
        assert!(second.await.is_err());
    }
}
