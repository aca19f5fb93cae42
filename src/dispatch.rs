//! Topic-filter matching, the subscription table, and the incoming-message
//! worker pool (C6, spec §4.3/§5).
//!
//! Filter matching follows `mqtt-proto::topic.rs`'s `Level`/`Filter` split:
//! a topic and a filter are both sliced on `/`, `+` matches exactly one
//! level, `#` matches the remaining levels (and must be the final one).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, warn};

use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level<'a> {
    Name(&'a str),
    SingleWildcard,
    MultiWildcard,
}

fn levels(s: &str) -> Vec<Level<'_>> {
    s.split('/')
        .map(|part| match part {
            "+" => Level::SingleWildcard,
            "#" => Level::MultiWildcard,
            name => Level::Name(name),
        })
        .collect()
}

/// Does `topic` match `filter`? `filter` may contain `+`/`#`; `topic` never
/// does (spec §4.3).
pub fn topic_matches(topic: &str, filter: &str) -> bool {
    let topic_levels = levels(topic);
    let filter_levels = levels(filter);

    let mut t = topic_levels.iter();
    let mut f = filter_levels.iter();

    loop {
        match (f.next(), t.next()) {
            (Some(Level::MultiWildcard), _) => return true,
            (Some(Level::SingleWildcard), Some(_)) => continue,
            (Some(Level::SingleWildcard), None) => return false,
            (Some(Level::Name(lhs)), Some(Level::Name(rhs))) => {
                if lhs != rhs {
                    return false;
                }
            }
            (Some(Level::Name(_)), _) => return false,
            (None, None) => return true,
            (None, Some(_)) => return false,
            (Some(_), None) => return false,
        }
    }
}

pub type EventCallback = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Default)]
struct Subscriptions {
    by_filter: HashMap<String, Vec<EventCallback>>,
}

/// Which topic filters this client is subscribed to, and the callbacks
/// registered against each (spec §4.3). Cloneable handle shared between the
/// client facade and the worker pool.
#[derive(Clone, Default)]
pub struct SubscriptionTable {
    inner: Arc<RwLock<Subscriptions>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        SubscriptionTable::default()
    }

    pub fn subscribe(&self, filter: impl Into<String>) {
        self.inner
            .write()
            .expect("subscriptions lock poisoned")
            .by_filter
            .entry(filter.into())
            .or_default();
    }

    pub fn unsubscribe(&self, filter: &str) {
        self.inner
            .write()
            .expect("subscriptions lock poisoned")
            .by_filter
            .remove(filter);
    }

    pub fn filters(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("subscriptions lock poisoned")
            .by_filter
            .keys()
            .cloned()
            .collect()
    }

    pub fn add_event_callback(&self, filter: impl Into<String>, callback: EventCallback) {
        self.inner
            .write()
            .expect("subscriptions lock poisoned")
            .by_filter
            .entry(filter.into())
            .or_default()
            .push(callback);
    }

    /// All callbacks registered against filters matching `topic`.
    pub fn callbacks_for(&self, topic: &str) -> Vec<EventCallback> {
        self.inner
            .read()
            .expect("subscriptions lock poisoned")
            .by_filter
            .iter()
            .filter(|(filter, _)| topic_matches(topic, filter))
            .flat_map(|(_, callbacks)| callbacks.iter().cloned())
            .collect()
    }
}

/// A raw decoded message paired with the topic it arrived on, queued for a
/// worker to route (spec §5's "parallel worker pool").
pub struct IncomingEnvelope {
    pub topic: String,
    pub message: Message,
}

/// Something that wants first refusal on an incoming message before it is
/// handed to event callbacks — the request/response correlator and the
/// request-callback dispatcher (spec §4.4) both implement this.
pub trait MessageSink: Send + Sync {
    /// Return `true` if this sink fully handled the message (an event
    /// subscriber fan-out should still happen separately for `Event`s).
    fn handle(&self, envelope: &IncomingEnvelope) -> bool;
}

/// Bounded incoming-message queue drained by a fixed worker pool (spec §5),
/// sized by `ClientConfig::incoming_message_queue_size`/
/// `incoming_message_thread_pool_size`.
pub struct Dispatcher {
    sender: Sender<IncomingEnvelope>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn start(
        queue_size: usize,
        worker_count: usize,
        subscriptions: SubscriptionTable,
        sinks: Vec<Arc<dyn MessageSink>>,
    ) -> Self {
        let (sender, receiver): (Sender<IncomingEnvelope>, Receiver<IncomingEnvelope>) =
            bounded(queue_size.max(1));

        let workers = (0..worker_count.max(1))
            .map(|worker_id| {
                let receiver = receiver.clone();
                let subscriptions = subscriptions.clone();
                let sinks = sinks.clone();

                std::thread::Builder::new()
                    .name(format!("dxl-worker-{worker_id}"))
                    .spawn(move || {
                        while let Ok(envelope) = receiver.recv() {
                            let handled = sinks.iter().any(|sink| sink.handle(&envelope));

                            if !handled {
                                for callback in subscriptions.callbacks_for(&envelope.topic) {
                                    callback(&envelope.message);
                                }
                            } else {
                                debug!("message on {} consumed by a non-event sink", envelope.topic);
                            }
                        }
                    })
                    .expect("failed to spawn dxl worker thread")
            })
            .collect();

        Dispatcher {
            sender,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue an incoming message, blocking the calling thread (the MQTT
    /// reader) when the queue is full rather than dropping it (spec §4.3
    /// backpressure).
    pub fn offer(&self, envelope: IncomingEnvelope) {
        if self.sender.send(envelope).is_err() {
            warn!("incoming message queue closed, dropping message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_topic_matches_itself() {
        assert!(topic_matches("/mcafee/event/foo", "/mcafee/event/foo"));
        assert!(!topic_matches("/mcafee/event/foo", "/mcafee/event/bar"));
    }

    #[test]
    fn single_wildcard_matches_one_level() {
        assert!(topic_matches("/mcafee/event/foo", "/mcafee/event/+"));
        assert!(!topic_matches("/mcafee/event/foo/bar", "/mcafee/event/+"));
    }

    #[test]
    fn multi_wildcard_matches_remaining_levels() {
        assert!(topic_matches("/mcafee/event/foo/bar", "/mcafee/event/#"));
        assert!(topic_matches("/mcafee/event", "/mcafee/event/#"));
        assert!(!topic_matches("/mcafee/other/foo", "/mcafee/event/#"));
    }

    #[test]
    fn wildcard_at_root_matches_everything() {
        assert!(topic_matches("/anything/at/all", "#"));
    }

    #[test]
    fn subscription_table_routes_by_filter() {
        let table = SubscriptionTable::new();
        table.subscribe("/mcafee/event/+");

        assert!(table.filters().contains(&"/mcafee/event/+".to_string()));
        assert_eq!(table.callbacks_for("/mcafee/event/foo").len(), 0);
    }
}
