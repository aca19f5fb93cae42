//! Integration coverage for the wire codec (spec §8 S5: codec round trip).

use dxl_client::{Body, Message, MessageKind};

#[test]
fn s5_request_round_trips_every_field() {
    let mut request = Message::new_request("{src}", "/t", "/r").with_service_id("{svc}");
    request.header.message_id = "{id-1}".into();
    request = request
        .with_payload(vec![0x01, 0x02])
        .with_other_field("h", "v")
        .with_source_tenant_id("{tnt}");

    let bytes = dxl_client::codec::encode(&request).unwrap();
    let mut decoded = dxl_client::codec::decode(&bytes).unwrap();
    decoded.header.destination_topic = "/t".into();

    assert_eq!(decoded.header.version, 3);
    assert_eq!(decoded.message_id(), "{id-1}");
    assert_eq!(decoded.header.source_client_id, "{src}");
    assert_eq!(decoded.destination_topic(), "/t");
    assert_eq!(decoded.header.payload, vec![0x01, 0x02]);
    assert_eq!(decoded.header.other_fields.get("h"), Some(&"v".to_string()));
    assert_eq!(decoded.header.source_tenant_id, "{tnt}");
    assert_eq!(decoded.kind(), MessageKind::Request);

    match decoded.body {
        Body::Request {
            ref reply_to_topic,
            ref service_id,
        } => {
            assert_eq!(reply_to_topic, "/r");
            assert_eq!(service_id, "{svc}");
        }
        _ => panic!("expected a Request body"),
    }
}

#[test]
fn event_without_optional_fields_round_trips() {
    let event = Message::new_event("{src}", "/isecg/sample/basicevent").with_payload(b"0".to_vec());
    let bytes = dxl_client::codec::encode(&event).unwrap();
    let decoded = dxl_client::codec::decode(&bytes).unwrap();

    assert_eq!(decoded.kind(), MessageKind::Event);
    assert_eq!(decoded.header.payload, b"0");
    assert!(decoded.header.other_fields.is_empty());
}
