//! Transmit queue: per-frame lifecycle tracking, one frame in flight at a
//! time, with a completion future released when an entry reaches a terminal
//! state (`Acked`/`Errored`) or the queue is cleared.
//!
//! Mutation is synchronous and happens behind a `critical-section`-guarded
//! cell (the teacher crate's own pattern for small, single-threaded shared
//! state); only the transport write inside [`TransmitQueue::drain`] actually
//! suspends.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex as AsyncMutex;
use embassy_sync::signal::Signal;

use crate::error::{CoreError, CoreResult, MAX_PAYLOAD_LEN};

type Waiter = Arc<Signal<CriticalSectionRawMutex, Result<u32, CoreError>>>;

/// Handle to a pending send, awaitable for its terminal outcome.
///
/// Resolves with `Ok(id)` on ack, `Err(RoutingError(..))` / `Err(TransportError(..))`
/// on failure, or `Err(Cancelled)` if the queue is cleared first.
#[derive(Clone)]
pub struct SendFuture(Waiter);

impl SendFuture {
    pub async fn wait(&self) -> Result<u32, CoreError> {
        self.0.wait().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    Sent,
}

struct Entry {
    payload: Vec<u8>,
    state: EntryState,
    waiter: Waiter,
}

#[derive(Default)]
struct Inner {
    order: VecDeque<u32>,
    entries: HashMap<u32, Entry>,
}

pub struct TransmitQueue {
    capacity: usize,
    inner: BlockingMutex<CriticalSectionRawMutex, RefCell<Inner>>,
    drain_lock: AsyncMutex<CriticalSectionRawMutex, ()>,
}

impl TransmitQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: BlockingMutex::new(RefCell::new(Inner::default())),
            drain_lock: AsyncMutex::new(()),
        }
    }

    /// Place `bytes` in `Pending` state under `id`. Synchronous: rejects
    /// oversize payloads and a full queue immediately, before anything is
    /// written to the transport.
    pub fn enqueue(&self, id: u32, bytes: Vec<u8>) -> CoreResult<SendFuture> {
        if bytes.len() > MAX_PAYLOAD_LEN {
            return Err(CoreError::PayloadTooLarge {
                len: bytes.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            if inner.entries.len() >= self.capacity {
                return Err(CoreError::QueueFull { capacity: self.capacity });
            }

            let waiter: Waiter = Arc::new(Signal::new());
            inner.entries.insert(
                id,
                Entry {
                    payload: bytes,
                    state: EntryState::Pending,
                    waiter: waiter.clone(),
                },
            );
            inner.order.push_back(id);
            Ok(SendFuture(waiter))
        })
    }

    /// Transfer as many `Pending` entries as the transport will accept, one
    /// at a time, transitioning each to `Sent`. Concurrent callers share a
    /// single in-flight slot via `drain_lock` — the next write never starts
    /// until the previous one's transport call returns.
    pub async fn drain<F, Fut>(&self, mut write: F) -> CoreResult<()>
    where
        F: FnMut(Vec<u8>) -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        let _guard = self.drain_lock.lock().await;

        loop {
            let next = self.inner.lock(|cell| {
                let mut inner = cell.borrow_mut();
                while let Some(id) = inner.order.pop_front() {
                    if let Some(entry) = inner.entries.get(&id) {
                        if entry.state == EntryState::Pending {
                            return Some((id, entry.payload.clone()));
                        }
                    }
                }
                None
            });

            let Some((id, payload)) = next else {
                break;
            };

            match write(payload).await {
                Ok(()) => {
                    self.inner.lock(|cell| {
                        if let Some(entry) = cell.borrow_mut().entries.get_mut(&id) {
                            entry.state = EntryState::Sent;
                        }
                    });
                }
                Err(reason) => {
                    let waiter = self.inner.lock(|cell| cell.borrow_mut().entries.remove(&id)).map(|e| e.waiter);
                    if let Some(waiter) = waiter {
                        waiter.signal(Err(CoreError::TransportError(reason)));
                    }
                }
            }
        }

        Ok(())
    }

    /// Transition the `Sent` entry matching `request_id` to `Acked`, resolving
    /// its future with the id. Unknown ids are a no-op.
    pub fn process_ack(&self, request_id: u32) {
        let waiter = self.inner.lock(|cell| cell.borrow_mut().entries.remove(&request_id)).map(|e| e.waiter);
        if let Some(waiter) = waiter {
            waiter.signal(Ok(request_id));
        }
    }

    /// Transition the entry matching `request_id` to `Errored` with `error`.
    /// Unknown ids are a no-op.
    pub fn process_error(&self, request_id: u32, error: CoreError) {
        let waiter = self.inner.lock(|cell| cell.borrow_mut().entries.remove(&request_id)).map(|e| e.waiter);
        if let Some(waiter) = waiter {
            waiter.signal(Err(error));
        }
    }

    /// Drop all live entries, releasing their waiters with `Cancelled`.
    pub fn clear(&self) {
        let drained = self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            inner.order.clear();
            inner.entries.drain().collect::<Vec<_>>()
        });
        for (_, entry) in drained {
            entry.waiter.signal(Err(CoreError::Cancelled));
        }
    }

    /// Number of entries that have not yet reached a terminal state.
    pub fn live_count(&self) -> usize {
        self.inner.lock(|cell| cell.borrow().entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_resolves_future_with_id() {
        futures::executor::block_on(async {
            let q = TransmitQueue::new(4);
            let fut = q.enqueue(7, b"hi".to_vec()).unwrap();
            q.drain(|_bytes| async { Ok(()) }).await.unwrap();
            q.process_ack(7);
            assert_eq!(fut.wait().await, Ok(7));
        });
    }

    #[test]
    fn unknown_ack_is_a_no_op() {
        futures::executor::block_on(async {
            let q = TransmitQueue::new(4);
            let fut = q.enqueue(7, b"hi".to_vec()).unwrap();
            q.process_ack(999); // unrelated id
            q.drain(|_bytes| async { Ok(()) }).await.unwrap();
            q.process_ack(7);
            assert_eq!(fut.wait().await, Ok(7));
        });
    }

    #[test]
    fn send_order_matches_enqueue_order() {
        futures::executor::block_on(async {
            let q = TransmitQueue::new(4);
            let _a = q.enqueue(1, b"a".to_vec()).unwrap();
            let _b = q.enqueue(2, b"b".to_vec()).unwrap();
            let _c = q.enqueue(3, b"c".to_vec()).unwrap();

            let seen = std::cell::RefCell::new(Vec::new());
            q.drain(|bytes| {
                seen.borrow_mut().push(bytes);
                async { Ok(()) }
            })
            .await
            .unwrap();

            assert_eq!(*seen.borrow(), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        });
    }

    #[test]
    fn oversize_payload_rejected_synchronously() {
        let q = TransmitQueue::new(4);
        let big = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(matches!(q.enqueue(1, big), Err(CoreError::PayloadTooLarge { .. })));
        assert_eq!(q.live_count(), 0);
    }

    #[test]
    fn clear_cancels_pending_waiters() {
        futures::executor::block_on(async {
            let q = TransmitQueue::new(4);
            let fut = q.enqueue(7, b"hi".to_vec()).unwrap();
            q.clear();
            assert_eq!(fut.wait().await, Err(CoreError::Cancelled));
        });
    }

    #[test]
    fn transport_write_failure_errors_the_future() {
        futures::executor::block_on(async {
            let q = TransmitQueue::new(4);
            let fut = q.enqueue(7, b"hi".to_vec()).unwrap();
            q.drain(|_bytes| async { Err("link down".to_string()) }).await.unwrap();
            assert_eq!(fut.wait().await, Err(CoreError::TransportError("link down".to_string())));
        });
    }
}
