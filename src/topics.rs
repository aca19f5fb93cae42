//! Reserved wire topics used by the fabric's service registry (spec §6).

/// Prefix under which every client's private reply-to topic lives:
/// `{REPLY_TO_PREFIX}{clientUniqueId}`.
pub const REPLY_TO_PREFIX: &str = "/mcafee/client/";

pub const SERVICE_REGISTER_REQUEST_TOPIC: &str = "/mcafee/service/dxl/svcregistry/register";
pub const SERVICE_UNREGISTER_REQUEST_TOPIC: &str = "/mcafee/service/dxl/svcregistry/unregister";

pub fn reply_to_topic(client_id: &str) -> String {
    format!("{REPLY_TO_PREFIX}{client_id}")
}
