//! The DXL client facade (C9, spec §3): wires the wire driver, dispatch,
//! correlator, and service registry into the public API described in
//! spec.md's Operations sections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info};
use timer::Timer;

use crate::codec;
use crate::config::ClientConfig;
use crate::correlator::Correlator;
use crate::dispatch::{Dispatcher, EventCallback, IncomingEnvelope, MessageSink, SubscriptionTable};
use crate::error::DxlError;
use crate::id::UniqueId;
use crate::message::{Body, Message};
use crate::service::{
    schedule_ttl_refresh, ServiceRegistrationBody, ServiceTable, ServiceUnregistrationBody,
};
use crate::topics::{reply_to_topic, SERVICE_REGISTER_REQUEST_TOPIC, SERVICE_UNREGISTER_REQUEST_TOPIC};
use crate::transport::{ConnectHook, TransportManager};
use crate::wire::{DriverEvent, MqttDriver};

pub type RequestCallback = Arc<dyn Fn(&Message) -> Result<Message, DxlError> + Send + Sync>;

/// Routes incoming `Request`s to whichever local service registered the
/// matching channel, the server-side mirror of [`crate::correlator::Correlator`]
/// on the client-side (spec §4.5).
#[derive(Default)]
struct RequestRouter {
    by_topic: Mutex<std::collections::HashMap<String, RequestCallback>>,
}

impl RequestRouter {
    fn register(&self, topic: impl Into<String>, callback: RequestCallback) {
        self.by_topic
            .lock()
            .expect("request router lock poisoned")
            .insert(topic.into(), callback);
    }
}

impl MessageSink for RequestRouter {
    fn handle(&self, envelope: &IncomingEnvelope) -> bool {
        let Body::Request { .. } = &envelope.message.body else {
            return false;
        };

        let callback = self
            .by_topic
            .lock()
            .expect("request router lock poisoned")
            .get(&envelope.topic)
            .cloned();

        let Some(callback) = callback else {
            return false;
        };

        match callback(&envelope.message) {
            Ok(_response) => {
                debug!("request on {} handled locally", envelope.topic);
            }
            Err(err) => error!("request callback for {} failed: {err}", envelope.topic),
        }
        true
    }
}

/// All local response callbacks registered via
/// [`DxlClient::add_response_callback`] (spec §4.4 async responses
/// delivered by topic rather than correlated to a specific request).
#[derive(Default)]
struct ResponseRouter {
    subscriptions: SubscriptionTable,
}

impl MessageSink for ResponseRouter {
    fn handle(&self, envelope: &IncomingEnvelope) -> bool {
        if !matches!(envelope.message.body, Body::Response { .. } | Body::Error { .. }) {
            return false;
        }
        let callbacks = self.subscriptions.callbacks_for(&envelope.topic);
        for callback in callbacks {
            callback(&envelope.message);
        }
        !self.subscriptions.filters().is_empty()
    }
}

struct ConnectReplay {
    client_id: UniqueId,
    subscriptions: SubscriptionTable,
    services: Arc<ServiceTable>,
}

impl ConnectHook for ConnectReplay {
    /// Re-subscribe to every still-wanted topic and re-register every
    /// still-active service (spec §4.2 post-connect resync, Testable
    /// Property 3: "post-connect subscription set invariant").
    fn on_connected(&self, driver: &mut dyn MqttDriver) -> Result<(), DxlError> {
        driver.subscribe(&reply_to_topic(&self.client_id.to_string()))?;

        for filter in self.subscriptions.filters() {
            driver.subscribe(&filter)?;
        }

        for body in self.services.all() {
            let register = Message::new_request(
                self.client_id.to_string(),
                SERVICE_REGISTER_REQUEST_TOPIC,
                reply_to_topic(&self.client_id.to_string()),
            )
            .with_payload(serde_json::to_vec(&body).map_err(|err| DxlError::Malformed(err.to_string()))?);

            let bytes = codec::encode(&register)?;
            driver.publish(register.destination_topic(), &bytes, true)?;
        }

        Ok(())
    }
}

/// The DXL fabric client (spec §3): connect to a broker, exchange events and
/// request/response messages, and register local services.
pub struct DxlClient {
    config: Arc<ClientConfig>,
    transport: Arc<TransportManager>,
    subscriptions: SubscriptionTable,
    correlator: Arc<Correlator>,
    services: Arc<ServiceTable>,
    response_router: Arc<ResponseRouter>,
    request_router: Arc<RequestRouter>,
    dispatcher: Dispatcher,
    ttl_timer: Timer,
    ttl_guards: Mutex<std::collections::HashMap<UniqueId, timer::Guard>>,
    reader_running: Arc<AtomicBool>,
    reader_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    self_weak: Weak<DxlClient>,
}

impl DxlClient {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let subscriptions = SubscriptionTable::new();
        let services = Arc::new(ServiceTable::new());
        let correlator = Correlator::new();
        let response_router = Arc::new(ResponseRouter::default());
        let request_router = Arc::new(RequestRouter::default());

        let hook = Box::new(ConnectReplay {
            client_id: config.client_id,
            subscriptions: subscriptions.clone(),
            services: services.clone(),
        });
        let transport = Arc::new(TransportManager::new(config.clone(), hook));

        let sinks: Vec<Arc<dyn MessageSink>> = vec![
            correlator.clone(),
            response_router.clone(),
            request_router.clone(),
        ];
        let dispatcher = Dispatcher::start(
            config.incoming_message_queue_size,
            config.incoming_message_thread_pool_size,
            subscriptions.clone(),
            sinks,
        );

        Arc::new_cyclic(|self_weak| DxlClient {
            config,
            transport,
            subscriptions,
            correlator,
            services,
            response_router,
            request_router,
            dispatcher,
            ttl_timer: Timer::new(),
            ttl_guards: Mutex::new(std::collections::HashMap::new()),
            reader_running: Arc::new(AtomicBool::new(false)),
            reader_handle: Mutex::new(None),
            self_weak: self_weak.clone(),
        })
    }

    pub fn unique_id(&self) -> UniqueId {
        self.config.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn connect(&self) -> Result<(), DxlError> {
        self.transport.connect()?;
        self.start_reader_thread();
        info!("connected as {}", self.config.client_id);
        Ok(())
    }

    /// Adopt an already-constructed driver instead of dialing a broker, then
    /// start the reader thread exactly as `connect` does. Lets a fully-wired
    /// `DxlClient` be driven against a fake `MqttDriver` in tests, with no
    /// real socket or TLS handshake.
    pub fn connect_with_driver(&self, driver: Box<dyn MqttDriver>) -> Result<(), DxlError> {
        self.transport.adopt_driver(driver)?;
        self.start_reader_thread();
        info!("connected as {} (injected driver)", self.config.client_id);
        Ok(())
    }

    pub fn disconnect(&self) {
        self.reader_running.store(false, Ordering::SeqCst);
        self.transport.disconnect();
        if let Some(handle) = self.reader_handle.lock().expect("reader handle lock poisoned").take() {
            let _ = handle.join();
        }
    }

    pub fn close(&self) {
        self.disconnect();
    }

    fn start_reader_thread(&self) {
        self.reader_running.store(true, Ordering::SeqCst);
        let client = self
            .self_weak
            .upgrade()
            .expect("client dropped while starting its own reader thread");

        let handle = std::thread::Builder::new()
            .name("dxl-reader".to_string())
            .spawn(move || {
                while client.reader_running.load(Ordering::SeqCst) {
                    let event = client
                        .transport
                        .with_driver(|driver| driver.next_event(Duration::from_millis(500)));

                    match event {
                        Ok(Some(DriverEvent::Publish { topic, payload })) => {
                            match codec::decode(&payload) {
                                Ok(mut message) => {
                                    message.header.destination_topic = topic.clone();
                                    client.dispatcher.offer(IncomingEnvelope { topic, message });
                                }
                                Err(err) => error!("dropping unparseable message on {topic}: {err}"),
                            }
                        }
                        Ok(Some(DriverEvent::Disconnected)) => {
                            error!("broker connection lost, reconnecting");
                            if let Err(err) = client.transport.reconnect() {
                                error!("reconnect failed: {err}");
                            }
                        }
                        Ok(None) => continue,
                        Err(DxlError::NotConnected) => {
                            std::thread::sleep(Duration::from_millis(100));
                        }
                        Err(err) => error!("error reading from broker: {err}"),
                    }
                }
            })
            .expect("failed to spawn dxl reader thread");

        *self.reader_handle.lock().expect("reader handle lock poisoned") = Some(handle);
    }

    pub fn subscribe(&self, topic_filter: impl Into<String>) -> Result<(), DxlError> {
        let filter = topic_filter.into();
        self.subscriptions.subscribe(filter.clone());
        self.transport.with_driver(|driver| driver.subscribe(&filter))
    }

    pub fn unsubscribe(&self, topic_filter: &str) -> Result<(), DxlError> {
        self.subscriptions.unsubscribe(topic_filter);
        self.transport.with_driver(|driver| driver.unsubscribe(topic_filter))
    }

    pub fn add_event_callback(&self, topic_filter: impl Into<String>, callback: EventCallback) {
        self.subscriptions.add_event_callback(topic_filter, callback);
    }

    pub fn add_response_callback(&self, topic_filter: impl Into<String>, callback: EventCallback) {
        self.response_router.subscriptions.add_event_callback(topic_filter, callback);
    }

    pub fn add_request_callback(&self, topic: impl Into<String>, callback: RequestCallback) {
        self.request_router.register(topic, callback);
    }

    pub fn send_event(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<(), DxlError> {
        let message = Message::new_event(self.config.client_id.to_string(), topic).with_payload(payload);
        let bytes = codec::encode(&message)?;
        self.transport.with_driver(|driver| driver.publish(topic, &bytes, false))
    }

    /// Send a request and block for its reply (spec §4.4). Registers with
    /// the correlator *before* publishing, so an answer that races ahead of
    /// this call returning is never missed (spec §8 property 2): insert,
    /// publish, then wait.
    pub fn sync_request(&self, mut request: Message, timeout: Duration) -> Result<Message, DxlError> {
        if !matches!(request.body, Body::Request { .. }) {
            return Err(DxlError::Malformed("sync_request requires a Request message".into()));
        }

        let request_id = request.message_id().to_string();
        if let Body::Request { reply_to_topic, .. } = &mut request.body {
            if reply_to_topic.is_empty() {
                *reply_to_topic = crate::topics::reply_to_topic(&self.config.client_id.to_string());
            }
        }

        let topic = request.destination_topic().to_string();
        let bytes = codec::encode(&request)?;

        let waiter = self.correlator.register_sync(&request_id);
        if let Err(err) = self.transport.with_driver(|driver| driver.publish(&topic, &bytes, true)) {
            self.correlator.forget(&request_id);
            return Err(err);
        }
        self.correlator.wait(waiter, timeout)
    }

    /// Send a request, invoking `callback` from a dispatch worker thread
    /// once the reply (or a timeout) arrives (spec §4.4 async requests).
    pub fn async_request(
        &self,
        mut request: Message,
        timeout: Duration,
        callback: impl FnOnce(Result<Message, DxlError>) + Send + 'static,
    ) -> Result<(), DxlError> {
        if !matches!(request.body, Body::Request { .. }) {
            return Err(DxlError::Malformed("async_request requires a Request message".into()));
        }

        let request_id = request.message_id().to_string();
        if let Body::Request { reply_to_topic, .. } = &mut request.body {
            if reply_to_topic.is_empty() {
                *reply_to_topic = crate::topics::reply_to_topic(&self.config.client_id.to_string());
            }
        }

        self.correlator.register_async(&request_id, timeout, Box::new(callback));

        let topic = request.destination_topic().to_string();
        let bytes = codec::encode(&request)?;
        if let Err(err) = self.transport.with_driver(|driver| driver.publish(&topic, &bytes, true)) {
            self.correlator.forget(&request_id);
            return Err(err);
        }
        Ok(())
    }

    pub fn send_response(&self, response: Message) -> Result<(), DxlError> {
        let topic = response.destination_topic().to_string();
        let bytes = codec::encode(&response)?;
        self.transport.with_driver(|driver| driver.publish(&topic, &bytes, true))
    }

    /// Register a local service with the fabric (spec §4.5): sync-requests
    /// the registry, subscribes to each listed topic bound to `callback` so
    /// the service can actually answer requests on it, then schedules the
    /// TTL keep-alive refresh and remembers the registration for
    /// post-reconnect replay.
    pub fn register_service_sync(
        &self,
        service_type: impl Into<String>,
        request_channels: Vec<String>,
        ttl_minutes: u32,
        timeout: Duration,
        callback: RequestCallback,
    ) -> Result<UniqueId, DxlError> {
        let service_guid = UniqueId::new();
        let body = ServiceRegistrationBody {
            service_type: service_type.into(),
            service_guid,
            request_channels,
            metadata: Default::default(),
            ttl_minutes,
        };

        let payload = serde_json::to_vec(&body).map_err(|err| DxlError::Malformed(err.to_string()))?;
        let request = Message::new_request(
            self.config.client_id.to_string(),
            SERVICE_REGISTER_REQUEST_TOPIC,
            reply_to_topic(&self.config.client_id.to_string()),
        )
        .with_payload(payload);

        let response = self.sync_request(request, timeout)?;
        if let Body::Error { error_code, error_message, .. } = &response.body {
            return Err(DxlError::Fabric {
                code: *error_code,
                message: error_message.clone(),
            });
        }

        self.services.insert(body.clone());

        for topic in &body.request_channels {
            self.transport.with_driver(|driver| driver.subscribe(topic))?;
            self.request_router.register(topic.clone(), callback.clone());
        }

        let services = self.services.clone();
        let guard = schedule_ttl_refresh(&self.ttl_timer, body, move |refreshed| {
            services.insert(refreshed.clone());
        });
        self.ttl_guards
            .lock()
            .expect("ttl guard table lock poisoned")
            .insert(service_guid, guard);

        Ok(service_guid)
    }

    pub fn unregister_service_sync(&self, service_guid: UniqueId, timeout: Duration) -> Result<(), DxlError> {
        let body = ServiceUnregistrationBody { service_guid };
        let payload = serde_json::to_vec(&body).map_err(|err| DxlError::Malformed(err.to_string()))?;

        let request = Message::new_request(
            self.config.client_id.to_string(),
            SERVICE_UNREGISTER_REQUEST_TOPIC,
            reply_to_topic(&self.config.client_id.to_string()),
        )
        .with_payload(payload);

        self.sync_request(request, timeout)?;
        self.services.remove(&service_guid);
        self.ttl_guards
            .lock()
            .expect("ttl guard table lock poisoned")
            .remove(&service_guid);
        Ok(())
    }
}
