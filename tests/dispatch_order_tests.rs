//! Covers the ordering half of spec §8 S6 ("queued publishes are delivered
//! in order") at the dispatch layer: a single worker drains the queue
//! strictly FIFO, so whatever enqueues events during a reconnect window
//! (the client facade's reader thread, re-driven after `reconnect()`
//! succeeds) delivers them in publish order.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dxl_client::dispatch::{Dispatcher, IncomingEnvelope, SubscriptionTable};
use dxl_client::message::Message;

#[test]
fn single_worker_delivers_queued_events_in_publish_order() {
    let subscriptions = SubscriptionTable::new();
    subscriptions.subscribe("/isecg/sample/basicevent");

    let order = Arc::new(Mutex::new(Vec::new()));
    let recorded = order.clone();
    subscriptions.add_event_callback(
        "/isecg/sample/basicevent",
        Arc::new(move |msg: &Message| {
            recorded
                .lock()
                .unwrap()
                .push(String::from_utf8(msg.header.payload.clone()).unwrap());
        }),
    );

    // A single worker thread guarantees FIFO delivery for queued messages,
    // matching the "delivered in order" requirement of S6.
    let dispatcher = Dispatcher::start(16, 1, subscriptions, Vec::new());

    for payload in ["first", "second"] {
        let message = Message::new_event("{b}", "/isecg/sample/basicevent").with_payload(payload);
        dispatcher.offer(IncomingEnvelope {
            topic: "/isecg/sample/basicevent".into(),
            message,
        });
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if order.lock().unwrap().len() >= 2 || std::time::Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(*order.lock().unwrap(), vec!["first".to_string(), "second".to_string()]);
}
