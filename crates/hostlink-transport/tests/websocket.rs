//! WebSocket transport against the loopback coordination server.

use std::time::Duration;

use hostlink_core::{Envelope, InstanceId};
use hostlink_transport::{
    CloseEvent, Connector, LoopbackServer, TransportEvent, WsConnector,
};
use serde_json::json;
use tokio::time::timeout;
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn connect_presents_instance_id_and_api_key() {
    let mut server = LoopbackServer::bind().await.unwrap();
    let connector = WsConnector::new(server.endpoint(), WAIT).with_api_key("live_123");
    let instance_id = InstanceId::new();

    let _conn = assert_ok!(connector.connect(instance_id).await);
    let remote = timeout(WAIT, server.accept()).await.unwrap().unwrap();

    assert_eq!(remote.instance_id, Some(instance_id.to_string()));
    assert_eq!(remote.api_key.as_deref(), Some("live_123"));
}

#[tokio::test]
async fn frames_flow_both_ways() {
    let mut server = LoopbackServer::bind().await.unwrap();
    let connector = WsConnector::new(server.endpoint(), WAIT);
    let mut conn = connector.connect(InstanceId::new()).await.unwrap();
    let mut remote = timeout(WAIT, server.accept()).await.unwrap().unwrap();

    let call = Envelope::call("c1".into(), "SEND_LOG", json!({"index": 0}));
    conn.transport.send(call.encode().unwrap()).await.unwrap();
    let received = timeout(WAIT, remote.recv()).await.unwrap().unwrap();
    assert_eq!(received, call);

    remote.reply_ok(&received, json!(true));
    let event = timeout(WAIT, conn.events.recv()).await.unwrap().unwrap();
    let TransportEvent::Message(text) = event else {
        panic!("expected a message, got {event:?}");
    };
    assert_eq!(
        Envelope::decode(&text).unwrap(),
        Envelope::success("c1".into(), "SEND_LOG", json!(true))
    );
}

#[tokio::test]
async fn ping_is_acknowledged() {
    let mut server = LoopbackServer::bind().await.unwrap();
    let connector = WsConnector::new(server.endpoint(), WAIT);
    let conn = connector.connect(InstanceId::new()).await.unwrap();
    let _remote = timeout(WAIT, server.accept()).await.unwrap().unwrap();

    assert_ok!(conn.transport.ping().await);
}

#[tokio::test]
async fn remote_close_fires_notification_with_code() {
    let mut server = LoopbackServer::bind().await.unwrap();
    let connector = WsConnector::new(server.endpoint(), WAIT);
    let mut conn = connector.connect(InstanceId::new()).await.unwrap();
    let remote = timeout(WAIT, server.accept()).await.unwrap().unwrap();

    remote.close(4000, "server restarting");

    let event = timeout(WAIT, conn.events.recv()).await.unwrap().unwrap();
    assert_eq!(
        event,
        TransportEvent::Closed(CloseEvent::new(4000, "server restarting"))
    );
    assert!(conn.transport.send("late".into()).await.is_err());
}

#[tokio::test]
async fn local_close_is_idempotent_and_notifies_once() {
    let mut server = LoopbackServer::bind().await.unwrap();
    let connector = WsConnector::new(server.endpoint(), WAIT);
    let mut conn = connector.connect(InstanceId::new()).await.unwrap();
    let _remote = timeout(WAIT, server.accept()).await.unwrap().unwrap();

    conn.transport.close().await;
    conn.transport.close().await;

    let event = timeout(WAIT, conn.events.recv()).await.unwrap().unwrap();
    assert!(matches!(event, TransportEvent::Closed(_)));
    let second = timeout(Duration::from_millis(200), conn.events.recv()).await;
    assert!(second.is_err(), "close notification fired twice: {second:?}");
}

#[tokio::test]
async fn connect_to_unreachable_endpoint_fails() {
    let server = LoopbackServer::bind().await.unwrap();
    let endpoint = server.endpoint();
    drop(server);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let connector = WsConnector::new(endpoint, WAIT);
    assert!(connector.connect(InstanceId::new()).await.is_err());
}
