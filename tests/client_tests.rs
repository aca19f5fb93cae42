//! End-to-end coverage of the `DxlClient` facade (spec §8 scenarios),
//! driven against an in-memory fake `MqttDriver` instead of a real broker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dxl_client::config::ClientConfig;
use dxl_client::message::{Body, Message};
use dxl_client::topics::{SERVICE_REGISTER_REQUEST_TOPIC, SERVICE_UNREGISTER_REQUEST_TOPIC};
use dxl_client::wire::{DriverEvent, MqttDriver};
use dxl_client::{codec, DxlClient, DxlError};

/// A fake broker: answers echo requests and service (un)registration
/// requests synchronously from inside `publish`, and lets a test inject an
/// arbitrary incoming event for the reader thread to pick up.
#[derive(Clone, Default)]
struct FakeBroker {
    inbox: Arc<Mutex<VecDeque<DriverEvent>>>,
}

const ECHO_TOPIC: &str = "/test/echo";

impl FakeBroker {
    fn inject(&self, event: DriverEvent) {
        self.inbox.lock().expect("fake broker inbox lock poisoned").push_back(event);
    }
}

impl MqttDriver for FakeBroker {
    fn connect(&mut self, _client_id: &str, _keep_alive: Duration) -> Result<(), DxlError> {
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], _qos1: bool) -> Result<(), DxlError> {
        let message = codec::decode(payload)?;
        let Body::Request { reply_to_topic, .. } = &message.body else {
            return Ok(());
        };

        let response = match topic {
            ECHO_TOPIC => Some(
                Message::new_response("{fake-broker}", &message)?.with_payload(message.header.payload.clone()),
            ),
            SERVICE_REGISTER_REQUEST_TOPIC | SERVICE_UNREGISTER_REQUEST_TOPIC => {
                Some(Message::new_response("{fake-registry}", &message)?)
            }
            _ => None,
        };

        if let Some(response) = response {
            let bytes = codec::encode(&response)?;
            self.inject(DriverEvent::Publish {
                topic: reply_to_topic.clone(),
                payload: bytes,
            });
        }

        Ok(())
    }

    fn subscribe(&mut self, _topic_filter: &str) -> Result<(), DxlError> {
        Ok(())
    }

    fn unsubscribe(&mut self, _topic_filter: &str) -> Result<(), DxlError> {
        Ok(())
    }

    fn ping(&mut self) -> Result<(), DxlError> {
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), DxlError> {
        Ok(())
    }

    fn next_event(&mut self, timeout: Duration) -> Result<Option<DriverEvent>, DxlError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.inbox.lock().expect("fake broker inbox lock poisoned").pop_front() {
                return Ok(Some(event));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

fn connected_client() -> (Arc<DxlClient>, FakeBroker) {
    let client = DxlClient::new(ClientConfig::default());
    let broker = FakeBroker::default();
    client
        .connect_with_driver(Box::new(broker.clone()))
        .expect("connect_with_driver must succeed against the fake broker");
    (client, broker)
}

#[test]
fn sync_request_round_trips_through_the_fake_broker() {
    let (client, _broker) = connected_client();

    let request = Message::new_request(client.unique_id().to_string(), ECHO_TOPIC, "")
        .with_payload(b"ping".to_vec());

    let response = client
        .sync_request(request, Duration::from_secs(2))
        .expect("echo service always answers");

    assert_eq!(response.header.payload, b"ping");
    assert!(matches!(response.body, Body::Response { .. }));

    client.disconnect();
}

#[test]
fn register_service_sync_binds_the_callback_to_its_topic() {
    let (client, broker) = connected_client();

    let called_with = Arc::new(Mutex::new(None));
    let called_with_clone = called_with.clone();
    let callback: dxl_client::RequestCallback = Arc::new(move |request: &Message| {
        *called_with_clone.lock().expect("callback state lock poisoned") =
            Some(request.header.payload.clone());
        Message::new_response("{svc}", request)
    });

    let service_topic = "/test/myservice";
    client
        .register_service_sync(
            "/test/myservice",
            vec![service_topic.to_string()],
            60,
            Duration::from_secs(2),
            callback,
        )
        .expect("service registration must succeed against the fake registry");

    // Simulate a peer invoking the registered service: a request arriving
    // on the bound topic, routed straight through the reader thread.
    let incoming = Message::new_request("{peer}", service_topic, "/peer/reply").with_payload(b"hello".to_vec());
    let bytes = codec::encode(&incoming).unwrap();
    broker.inject(DriverEvent::Publish {
        topic: service_topic.to_string(),
        payload: bytes,
    });

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if called_with.lock().expect("callback state lock poisoned").is_some() {
            break;
        }
        assert!(Instant::now() < deadline, "registered service callback never fired");
        std::thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(
        called_with.lock().expect("callback state lock poisoned").take().unwrap(),
        b"hello"
    );

    client.disconnect();
}

#[test]
fn sync_request_times_out_when_nothing_answers() {
    let (client, _broker) = connected_client();

    let request = Message::new_request(client.unique_id().to_string(), "/test/nobody-home", "");
    let result = client.sync_request(request, Duration::from_millis(100));

    assert!(matches!(result, Err(DxlError::WaitTimeout)));
    client.disconnect();
}

#[test]
fn async_request_fires_its_callback_from_the_reader_thread() {
    let (client, _broker) = connected_client();

    let fired = Arc::new(AtomicBool::new(false));
    let fired_clone = fired.clone();
    let request = Message::new_request(client.unique_id().to_string(), ECHO_TOPIC, "")
        .with_payload(b"async-ping".to_vec());

    client
        .async_request(request, Duration::from_secs(2), move |result| {
            assert_eq!(result.unwrap().header.payload, b"async-ping");
            fired_clone.store(true, Ordering::SeqCst);
        })
        .expect("publish must succeed");

    let deadline = Instant::now() + Duration::from_secs(2);
    while !fired.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "async callback never fired");
        std::thread::sleep(Duration::from_millis(10));
    }

    client.disconnect();
}
