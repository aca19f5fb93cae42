//! Service registration with the fabric's service registry (C8, spec §4.5).
//!
//! Registration/unregistration bodies are typed structs deriving
//! `serde::{Serialize, Deserialize}` and sent as a sync request's payload,
//! the way every pack repo speaking a JSON control plane (`openclaw`,
//! `2389-research`) does rather than hand-building JSON strings.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use timer::{Guard, Timer};

use crate::id::UniqueId;

/// A local service's registration state (spec §3 `ServiceRegistrationInfo`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRegistrationBody {
    #[serde(rename = "serviceType")]
    pub service_type: String,
    #[serde(rename = "serviceGuid")]
    pub service_guid: UniqueId,
    #[serde(rename = "requestChannels")]
    pub request_channels: Vec<String>,
    #[serde(rename = "metaData", skip_serializing_if = "HashMap::is_empty", default)]
    pub metadata: HashMap<String, String>,
    #[serde(rename = "ttlMins")]
    pub ttl_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceUnregistrationBody {
    #[serde(rename = "serviceGuid")]
    pub service_guid: UniqueId,
}

/// Grace period subtracted from the TTL before scheduling a refresh (spec
/// §4.5), so the re-registration lands comfortably before the registry
/// would consider the service stale.
const TTL_REFRESH_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Floor on the refresh interval, so a very short TTL doesn't turn into a
/// tight re-registration loop (spec §4.5).
const TTL_REFRESH_LOWER_LIMIT: Duration = Duration::from_secs(60);

/// Schedules the periodic re-registration refresh (spec §4.5 TTL) for a
/// service already accepted by the registry, at `max(ttlMins·60 -
/// gracePeriod, lowerLimit)` seconds. `send_registration` re-sends the same
/// body; it is expected to be the client facade's sync-request call against
/// the service registry's register topic.
pub fn schedule_ttl_refresh(
    timer: &Timer,
    body: ServiceRegistrationBody,
    send_registration: impl Fn(&ServiceRegistrationBody) + Send + 'static,
) -> Guard {
    let ttl_seconds = (body.ttl_minutes as u64).saturating_mul(60);
    let interval_secs = ttl_seconds
        .saturating_sub(TTL_REFRESH_GRACE_PERIOD.as_secs())
        .max(TTL_REFRESH_LOWER_LIMIT.as_secs());
    let interval = chrono::Duration::seconds(interval_secs as i64);
    let body = Arc::new(Mutex::new(body));

    timer.schedule_repeating(interval, move || {
        let body = body.lock().expect("service registration body lock poisoned");
        debug!("refreshing registration for service {}", body.service_guid);
        send_registration(&body);
    })
}

/// Tracks locally-registered services so a reconnect can replay their
/// registrations against the fresh session (spec §4.2 post-connect resync,
/// §4.5 "service survives broker reconnect").
#[derive(Default)]
pub struct ServiceTable {
    services: Mutex<HashMap<UniqueId, ServiceRegistrationBody>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        ServiceTable::default()
    }

    pub fn insert(&self, body: ServiceRegistrationBody) {
        self.services
            .lock()
            .expect("service table lock poisoned")
            .insert(body.service_guid, body);
    }

    pub fn remove(&self, service_guid: &UniqueId) {
        let removed = self
            .services
            .lock()
            .expect("service table lock poisoned")
            .remove(service_guid);
        if removed.is_none() {
            warn!("unregister called for an unknown service {service_guid}");
        }
    }

    pub fn all(&self) -> Vec<ServiceRegistrationBody> {
        self.services
            .lock()
            .expect("service table lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

pub const DEFAULT_TTL_MINUTES: u32 = 60;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_body_round_trips_through_json() {
        let body = ServiceRegistrationBody {
            service_type: "/mycompany/myservice".into(),
            service_guid: UniqueId::new(),
            request_channels: vec!["/mycompany/myservice/topic".into()],
            metadata: HashMap::new(),
            ttl_minutes: DEFAULT_TTL_MINUTES,
        };

        let json = serde_json::to_vec(&body).unwrap();
        let decoded: ServiceRegistrationBody = serde_json::from_slice(&json).unwrap();

        assert_eq!(decoded.service_guid, body.service_guid);
        assert_eq!(decoded.request_channels, body.request_channels);
    }

    #[test]
    fn service_table_tracks_insert_and_remove() {
        let table = ServiceTable::new();
        let id = UniqueId::new();
        table.insert(ServiceRegistrationBody {
            service_type: "/t".into(),
            service_guid: id,
            request_channels: vec![],
            metadata: HashMap::new(),
            ttl_minutes: DEFAULT_TTL_MINUTES,
        });

        assert_eq!(table.all().len(), 1);
        table.remove(&id);
        assert_eq!(table.all().len(), 0);
    }
}
