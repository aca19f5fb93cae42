//! Request/response correlation (C7, spec §4.4).
//!
//! Every outgoing `Request` is registered here under its message id before
//! it is published, closing the race where a very fast broker/service could
//! answer before the client finishes setting up to receive the reply (spec
//! §8 property 2, "exactly-once response delivery"). A reply that still
//! wins that race — arriving before the waiter is registered at all — is
//! buffered by request id for a short grace window rather than dropped.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::warn;
use timer::{Guard, Timer};

use crate::dispatch::{IncomingEnvelope, MessageSink};
use crate::error::DxlError;
use crate::message::{Body, Message};

type AsyncCallback = Box<dyn FnOnce(Result<Message, DxlError>) + Send>;
type SyncSlot = Arc<(Mutex<Option<Result<Message, DxlError>>>, Condvar)>;

enum Waiter {
    Sync(SyncSlot),
    Async {
        callback: AsyncCallback,
        deadline: Instant,
    },
}

/// A response/error that raced ahead of `register_sync`/`register_async`
/// (spec §4.4): buffered by request id for a short grace window instead of
/// being dropped.
const EARLY_RESPONSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Default)]
struct PendingTable {
    by_request_id: HashMap<String, Waiter>,
    early: HashMap<String, (Instant, Result<Message, DxlError>)>,
}

/// A sync wait handle returned by [`Correlator::register_sync`]; hand it to
/// [`Correlator::wait`] after publishing the request.
pub struct SyncWaiter {
    request_id: String,
    slot: SyncSlot,
}

/// Tracks in-flight requests and matches responses/errors back to them by
/// `request_message_id` (spec §3/§4.4). One correlator instance is shared
/// between the client facade (registers waiters, blocks on them) and the
/// dispatch worker pool (delivers matching `Response`/`Error` messages).
pub struct Correlator {
    pending: Arc<Mutex<PendingTable>>,
    _sweep_timer: Timer,
    _sweep_guard: Guard,
}

impl Correlator {
    pub fn new() -> Arc<Self> {
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let sweep_timer = Timer::new();

        let sweep_pending = pending.clone();
        let guard = sweep_timer.schedule_repeating(chrono::Duration::seconds(1), move || {
            sweep_expired(&sweep_pending);
        });

        Arc::new(Correlator {
            pending,
            _sweep_timer: sweep_timer,
            _sweep_guard: guard,
        })
    }

    /// Register `request_id` so a matching response/error can be delivered
    /// to it, *before* the request is published (spec §4.4 sync request: the
    /// call order is insert, publish, then wait). If a reply already raced
    /// ahead and is sitting in the early-response buffer, it is consumed
    /// immediately and the returned waiter resolves on the first `wait`.
    pub fn register_sync(&self, request_id: &str) -> SyncWaiter {
        let slot: SyncSlot = Arc::new((Mutex::new(None), Condvar::new()));

        let mut table = self.pending.lock().expect("pending table lock poisoned");
        if let Some((_, result)) = table.early.remove(request_id) {
            *slot.0.lock().expect("wait slot lock poisoned") = Some(result);
        } else {
            table
                .by_request_id
                .insert(request_id.to_string(), Waiter::Sync(slot.clone()));
        }

        SyncWaiter {
            request_id: request_id.to_string(),
            slot,
        }
    }

    /// Block the calling thread until `waiter` resolves or `timeout` elapses.
    pub fn wait(&self, waiter: SyncWaiter, timeout: Duration) -> Result<Message, DxlError> {
        let (lock, condvar) = &*waiter.slot;
        let mut guard = lock.lock().expect("wait slot lock poisoned");
        let deadline = Instant::now() + timeout;

        while guard.is_none() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.forget(&waiter.request_id);
                return Err(DxlError::WaitTimeout);
            }

            let (new_guard, timeout_result) = condvar
                .wait_timeout(guard, remaining)
                .expect("wait slot lock poisoned");
            guard = new_guard;

            if timeout_result.timed_out() && guard.is_none() {
                self.forget(&waiter.request_id);
                return Err(DxlError::WaitTimeout);
            }
        }

        guard.take().expect("checked is_some")
    }

    /// Convenience wrapper over `register_sync` + `wait` for callers that
    /// have no publish step to interleave (e.g. tests).
    pub fn wait_for_response(&self, request_id: &str, timeout: Duration) -> Result<Message, DxlError> {
        let waiter = self.register_sync(request_id);
        self.wait(waiter, timeout)
    }

    /// Register an async callback for `request_id`, invoked exactly once
    /// from the dispatch worker thread that receives the matching reply, or
    /// from the timeout sweep if none arrives by `timeout`. A reply already
    /// sitting in the early-response buffer fires the callback immediately.
    pub fn register_async(&self, request_id: &str, timeout: Duration, callback: AsyncCallback) {
        let early = {
            let mut table = self.pending.lock().expect("pending table lock poisoned");
            match table.early.remove(request_id) {
                Some((_, result)) => Some(result),
                None => {
                    table.by_request_id.insert(
                        request_id.to_string(),
                        Waiter::Async {
                            callback,
                            deadline: Instant::now() + timeout,
                        },
                    );
                    None
                }
            }
        };

        if let Some(result) = early {
            callback(result);
        }
    }

    /// Remove a waiter without resolving it, e.g. after a publish failure
    /// that means no reply will ever arrive for `request_id`.
    pub fn forget(&self, request_id: &str) {
        self.pending
            .lock()
            .expect("pending table lock poisoned")
            .by_request_id
            .remove(request_id);
    }

    /// Deliver a response/error for `request_id`. Always returns `true`: a
    /// registered waiter is resolved directly, and an unmatched reply is
    /// buffered for [`EARLY_RESPONSE_GRACE`] in case its waiter is still
    /// being set up (spec §4.4 grace window).
    fn deliver(&self, request_id: &str, result: Result<Message, DxlError>) -> bool {
        let mut table = self.pending.lock().expect("pending table lock poisoned");
        let waiter = table.by_request_id.remove(request_id);

        match waiter {
            Some(Waiter::Sync(slot)) => {
                drop(table);
                let (lock, condvar) = &*slot;
                *lock.lock().expect("wait slot lock poisoned") = Some(result);
                condvar.notify_all();
                true
            }
            Some(Waiter::Async { callback, .. }) => {
                drop(table);
                callback(result);
                true
            }
            None => {
                table.early.insert(request_id.to_string(), (Instant::now(), result));
                true
            }
        }
    }
}

/// Invoked off the `timer` crate's background thread (spec §4.4 async
/// request timeout sweep): fires any async callback whose deadline has
/// passed and that no response ever arrived for.
fn sweep_expired(pending: &Mutex<PendingTable>) {
    let now = Instant::now();
    let expired: Vec<(String, AsyncCallback)> = {
        let mut table = pending.lock().expect("pending table lock poisoned");
        let expired_ids: Vec<String> = table
            .by_request_id
            .iter()
            .filter_map(|(id, waiter)| match waiter {
                Waiter::Async { deadline, .. } if *deadline <= now => Some(id.clone()),
                _ => None,
            })
            .collect();

        let expired = expired_ids
            .into_iter()
            .filter_map(|id| match table.by_request_id.remove(&id) {
                Some(Waiter::Async { callback, .. }) => Some((id, callback)),
                _ => None,
            })
            .collect();

        table
            .early
            .retain(|_, (received_at, _)| now.duration_since(*received_at) < EARLY_RESPONSE_GRACE);

        expired
    };

    for (id, callback) in expired {
        warn!("async request {id} timed out waiting for a response");
        callback(Err(DxlError::WaitTimeout));
    }
}

impl MessageSink for Correlator {
    fn handle(&self, envelope: &IncomingEnvelope) -> bool {
        match &envelope.message.body {
            Body::Response {
                request_message_id, ..
            } => self.deliver(request_message_id, Ok(envelope.message.clone())),
            Body::Error {
                request_message_id,
                error_code,
                error_message,
                ..
            } => self.deliver(
                request_message_id,
                Err(DxlError::Fabric {
                    code: *error_code,
                    message: error_message.clone(),
                }),
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn sync_wait_resolves_once_response_is_delivered() {
        let correlator = Correlator::new();
        let request = Message::new_request("{client}", "/topic", "/reply");
        let request_id = request.message_id().to_string();
        let response = Message::new_response("{svc}", &request).unwrap();

        let correlator_clone = correlator.clone();
        let response_clone = response.clone();
        let request_id_clone = request_id.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            correlator_clone.handle(&IncomingEnvelope {
                topic: "/reply".into(),
                message: response_clone,
            });
            let _ = request_id_clone;
        });

        let result = correlator.wait_for_response(&request_id, Duration::from_secs(2));
        handle.join().unwrap();

        assert_eq!(result.unwrap(), response);
    }

    #[test]
    fn sync_wait_times_out_when_nothing_arrives() {
        let correlator = Correlator::new();
        let result = correlator.wait_for_response("{no-such-request}", Duration::from_millis(30));
        assert!(matches!(result, Err(DxlError::WaitTimeout)));
    }

    #[test]
    fn async_callback_fires_exactly_once() {
        let correlator = Correlator::new();
        let request = Message::new_request("{client}", "/topic", "/reply");
        let request_id = request.message_id().to_string();
        let response = Message::new_response("{svc}", &request).unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        correlator.register_async(
            &request_id,
            Duration::from_secs(2),
            Box::new(move |result| {
                assert!(result.is_ok());
                fired_clone.store(true, Ordering::SeqCst);
            }),
        );

        let handled = correlator.handle(&IncomingEnvelope {
            topic: "/reply".into(),
            message: response,
        });

        assert!(handled);
        assert!(fired.load(Ordering::SeqCst));
    }
}
