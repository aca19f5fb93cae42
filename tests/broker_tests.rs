//! Integration coverage for broker descriptor parsing and latency ranking
//! (spec §4.6, §9 "bounded worker group" probing).

use std::net::TcpListener;
use std::time::Duration;

use dxl_client::broker::{rank_by_latency, Broker, BrokerProtocol};

fn listening_broker(id: &str) -> (TcpListener, Broker) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, Broker::new(id, port, "127.0.0.1"))
}

#[test]
fn rank_by_latency_puts_reachable_brokers_before_unreachable_ones() {
    let (_listener_a, broker_a) = listening_broker("{a}");
    let (_listener_b, broker_b) = listening_broker("{b}");

    // Nothing is listening on this port: connection attempts fail outright.
    let unreachable = Broker::new("{c}", 1, "127.0.0.1");

    let ranked = rank_by_latency(
        &[unreachable.clone(), broker_a.clone(), broker_b.clone()],
        Duration::from_millis(500),
    );

    assert_eq!(ranked.len(), 3);
    assert!(ranked[0].response_time.is_some());
    assert!(ranked[1].response_time.is_some());
    assert_eq!(ranked[2].id, unreachable.id);
    assert!(ranked[2].response_time.is_none());
}

#[test]
fn parse_round_trips_through_uri_helpers() {
    let broker = Broker::parse(
        "{a1b2c3d4-e5f6-7890-abcd-ef1234567890};8883;broker1.example.com;10.0.0.1",
        BrokerProtocol::MqttWs,
    )
    .unwrap();

    assert_eq!(broker.to_server_uri(), "wss://broker1.example.com:8883");
    assert_eq!(
        broker.to_alternative_server_uri().unwrap(),
        "wss://10.0.0.1:8883"
    );
}
