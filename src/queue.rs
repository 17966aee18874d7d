//! Request queue.
//!
//! Submitted requests sit in a [`Slots`] arena until they complete. Each
//! call to [`RequestQueue::process`] walks every entry in submission order:
//! entries that are in flight or still gated by `wait_until` are skipped,
//! finished ones are collected for removal, and the rest are handed to a
//! spawned dispatch task. Dispatch tasks never touch the arena directly;
//! they report back over a channel and the next scan applies the result.
//!
//! ```text
//!   queued ──► waiting (wait_until) ──► dispatching ──► settled ──► removed
//!                  ▲                         │
//!                  └──── requeued ◄──────────┘  (gated, 429, retryable error)
//! ```

use crate::error::{Error, Result};
use crate::gate::Gate;
use crate::headers::RateLimitHeaders;
use crate::rate_limit::current_time_ms;
use crate::transport::{ApiRequest, Transport, TransportResponse};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Growable sequence with a logical length separate from its backing store.
///
/// Removal never shrinks the store: [`Slots::splice_many`] compacts
/// survivors forward in one pass and empties the tail, so the freed slots are
/// reused by later pushes.
#[derive(Debug)]
pub struct Slots<T> {
    items: Vec<Option<T>>,
    len: usize,
}

impl<T> Slots<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    pub fn push(&mut self, item: T) {
        if self.len < self.items.len() {
            self.items[self.len] = Some(item);
        } else {
            self.items.push(Some(item));
        }
        self.len += 1;
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        if index < self.len {
            self.items[index].as_ref()
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items[..self.len].iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items[..self.len].iter_mut().flatten()
    }

    /// Remove every index in `removed` (ascending) and keep the relative
    /// order of the survivors.
    pub fn splice_many(&mut self, removed: &[usize]) {
        if removed.is_empty() {
            return;
        }

        let mut pending = removed.iter().copied().peekable();
        let mut write = 0;

        for read in 0..self.len {
            let mut drop_slot = false;
            while pending.peek().is_some_and(|&idx| idx <= read) {
                drop_slot |= pending.next() == Some(read);
            }

            if drop_slot {
                self.items[read] = None;
                continue;
            }
            // every slot in [write, read) is empty at this point
            if write != read {
                self.items.swap(write, read);
            }
            write += 1;
        }

        self.len = write;
    }
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Self::new()
    }
}

type Completion = oneshot::Sender<Result<TransportResponse>>;

struct Entry {
    id: u64,
    request: Arc<ApiRequest>,
    wait_until: Option<u64>,
    running: bool,
    /// Taken while a dispatch task owns it.
    completion: Option<Completion>,
    settled: bool,
}

enum Outcome {
    /// The caller has been resolved or rejected.
    Settled,
    Requeue {
        wait_until: Option<u64>,
        completion: Completion,
    },
}

struct Pending {
    entries: Slots<Entry>,
    removed: Vec<usize>,
}

/// Paces submitted requests against a [`Gate`] and sends them through a
/// [`Transport`]. Every submitter is settled exactly once.
pub struct RequestQueue<T: Transport, G: Gate> {
    pending: Mutex<Pending>,
    processing: AtomicBool,
    next_id: AtomicU64,
    outcomes_tx: mpsc::UnboundedSender<(u64, Outcome)>,
    outcomes_rx: Mutex<mpsc::UnboundedReceiver<(u64, Outcome)>>,
    transport: Arc<T>,
    gate: Arc<G>,
}

impl<T: Transport, G: Gate> RequestQueue<T, G> {
    pub fn new(transport: Arc<T>, gate: Arc<G>) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            pending: Mutex::new(Pending {
                entries: Slots::new(),
                removed: Vec::new(),
            }),
            processing: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            outcomes_tx,
            outcomes_rx: Mutex::new(outcomes_rx),
            transport,
            gate,
        }
    }

    /// Number of entries not yet removed, including in-flight ones.
    pub fn len(&self) -> usize {
        self.pending.lock().map_or(0, |p| p.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue requests; each gets its own completion receiver.
    pub fn push<I>(&self, requests: I) -> Result<Vec<oneshot::Receiver<Result<TransportResponse>>>>
    where
        I: IntoIterator<Item = ApiRequest>,
    {
        let mut pending = self.lock_pending()?;
        let receivers = requests
            .into_iter()
            .map(|request| {
                let (tx, rx) = oneshot::channel();
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                pending.entries.push(Entry {
                    id,
                    request: Arc::new(request),
                    wait_until: None,
                    running: false,
                    completion: Some(tx),
                    settled: false,
                });
                rx
            })
            .collect();
        Ok(receivers)
    }

    /// Enqueue one request and wait for its result. Requires the queue to be
    /// processed, normally by [`RequestQueue::spawn`].
    pub async fn submit(&self, request: ApiRequest) -> Result<TransportResponse> {
        let receiver = self
            .push([request])?
            .pop()
            .ok_or_else(|| Error::Internal("push returned no receiver".to_string()))?;
        receiver.await.map_err(|_| Error::QueueClosed)?
    }

    /// One scan over the queue. Does nothing while another scan is running.
    /// Must be called from within a tokio runtime.
    pub fn process(&self) {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let _guard = ProcessingGuard(&self.processing);

        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        if pending.entries.is_empty() {
            return;
        }

        let mut outcomes = self.drain_outcomes();
        let now = current_time_ms();
        let Pending { entries, removed } = &mut *pending;
        removed.clear();

        for (index, entry) in entries.iter_mut().enumerate() {
            if let Some(outcome) = outcomes.remove(&entry.id) {
                entry.running = false;
                match outcome {
                    Outcome::Settled => entry.settled = true,
                    Outcome::Requeue {
                        wait_until,
                        completion,
                    } => {
                        entry.wait_until = wait_until;
                        entry.completion = Some(completion);
                    }
                }
            }

            if entry.running {
                continue;
            }
            if entry.settled {
                removed.push(index);
                continue;
            }
            if entry.wait_until.is_some_and(|until| until > now) {
                continue;
            }

            let completion = match entry.completion.take() {
                Some(completion) if !completion.is_closed() => completion,
                _ => {
                    // submitter went away; nobody left to settle
                    debug!(id = entry.id, "Dropping abandoned request");
                    removed.push(index);
                    continue;
                }
            };

            entry.running = true;
            entry.wait_until = None;
            tokio::spawn(dispatch(
                entry.id,
                entry.request.clone(),
                completion,
                self.transport.clone(),
                self.gate.clone(),
                self.outcomes_tx.clone(),
            ));
        }

        entries.splice_many(removed);
    }

    /// Run [`RequestQueue::process`] every `period` until the queue is dropped.
    pub fn spawn(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let queue: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match queue.upgrade() {
                    Some(queue) => queue.process(),
                    None => break,
                }
            }
        })
    }

    fn drain_outcomes(&self) -> HashMap<u64, Outcome> {
        let mut outcomes = HashMap::new();
        if let Ok(mut rx) = self.outcomes_rx.lock() {
            while let Ok((id, outcome)) = rx.try_recv() {
                outcomes.insert(id, outcome);
            }
        }
        outcomes
    }

    fn lock_pending(&self) -> Result<std::sync::MutexGuard<'_, Pending>> {
        self.pending
            .lock()
            .map_err(|_| Error::Internal("Failed to acquire queue lock".to_string()))
    }
}

struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn dispatch<T: Transport, G: Gate>(
    id: u64,
    request: Arc<ApiRequest>,
    completion: Completion,
    transport: Arc<T>,
    gate: Arc<G>,
    outcomes: mpsc::UnboundedSender<(u64, Outcome)>,
) {
    let meta = request.meta();

    let outcome = match gate.authorize(&meta).await {
        Ok(authorization) if !authorization.is_granted() => {
            debug!(
                method = %meta.method,
                url = %meta.url,
                wait_for_ms = authorization.wait_for_ms,
                global = authorization.global,
                "Request gated"
            );
            Outcome::Requeue {
                wait_until: Some(current_time_ms() + authorization.wait_for_ms),
                completion,
            }
        }
        Ok(_) => match transport.send(&request).await {
            Ok(response) => {
                if let Err(e) = gate.observe(&meta, &response).await {
                    warn!(url = %meta.url, error = %e, "Failed to record response");
                }

                if response.status == 429 {
                    let wait_until = RateLimitHeaders::parse(&response.headers)
                        .map(|h| current_time_ms() + h.reset_after_ms);
                    warn!(url = %meta.url, "Rate limited by remote, requeueing");
                    Outcome::Requeue {
                        wait_until,
                        completion,
                    }
                } else {
                    let _ = completion.send(Ok(response));
                    Outcome::Settled
                }
            }
            Err(e) => {
                if let Err(cancel_err) = gate.cancel(&meta).await {
                    warn!(url = %meta.url, error = %cancel_err, "Failed to return reservation");
                }
                settle_or_requeue(e, completion)
            }
        },
        Err(e) => settle_or_requeue(e, completion),
    };

    // the receiver only disappears with the queue itself
    let _ = outcomes.send((id, outcome));
}

fn settle_or_requeue(error: Error, completion: Completion) -> Outcome {
    if error.is_retryable() {
        debug!(error = %error, "Dispatch failed, will retry");
        Outcome::Requeue {
            wait_until: None,
            completion,
        }
    } else {
        warn!(error = %error, "Dispatch failed permanently, dropping request");
        let _ = completion.send(Err(error));
        Outcome::Settled
    }
}
