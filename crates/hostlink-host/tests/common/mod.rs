//! Shared harness: a host over the in-memory transport and a scripted service.

#![allow(dead_code)]

use std::sync::Arc;

use hostlink_core::{ClientConfig, Envelope, IoRenderInstruction};
use hostlink_host::{Actions, HostClient};
use hostlink_transport::{MemoryPeer, MemoryRemote, memory_transport};
use serde_json::{Value, json};

pub fn client(actions: Actions) -> (HostClient, MemoryRemote) {
    let (connector, remote) = memory_transport();
    let config = ClientConfig::default().with_api_key("test_key");
    let client = HostClient::with_connector(config, actions, Arc::new(connector)).unwrap();
    (client, remote)
}

pub fn init_success() -> Value {
    json!({
        "type": "success",
        "environment": "development",
        "invalidSlugs": [],
        "organization": {"name": "Acme", "slug": "acme"},
        "dashboardUrl": "https://example.com/dashboard/acme"
    })
}

/// Next call written by the host, skipping its replies to our calls.
pub async fn expect_call(peer: &mut MemoryPeer, method: &str) -> Envelope {
    loop {
        let envelope = peer.recv().await.expect("socket closed");
        if let Envelope::Call { .. } = envelope {
            assert_eq!(envelope.method(), method, "unexpected call {envelope:?}");
            return envelope;
        }
    }
}

/// Accept the next socket and answer its `INITIALIZE_HOST`.
pub async fn accept_initialized(remote: &mut MemoryRemote) -> MemoryPeer {
    let mut peer = remote.accept().await.expect("no socket");
    let init = expect_call(&mut peer, "INITIALIZE_HOST").await;
    peer.reply_ok(&init, init_success());
    peer
}

/// Start `listen()` and serve its first initialization.
pub async fn listening(client: &HostClient, remote: &mut MemoryRemote) -> MemoryPeer {
    let listener = {
        let client = client.clone();
        tokio::spawn(async move { client.listen().await })
    };
    let peer = accept_initialized(remote).await;
    listener.await.unwrap().unwrap();
    peer
}

pub fn payload(call: &Envelope) -> &Value {
    match call {
        Envelope::Call { payload, .. } => payload,
        Envelope::Reply { .. } => panic!("expected a call"),
    }
}

pub fn start_transaction(peer: &MemoryPeer, transaction_id: &str, action: &str) {
    peer.call(
        "START_TRANSACTION",
        json!({
            "transactionId": transaction_id,
            "actionName": action,
            "environment": "development",
            "user": {"email": "ops@example.com"},
            "params": {}
        }),
    );
}

pub fn render_instruction(io_call: &Envelope) -> IoRenderInstruction {
    let text = payload(io_call)["ioCall"].as_str().expect("ioCall string");
    serde_json::from_str(text).unwrap()
}

pub fn io_response(peer: &MemoryPeer, transaction_id: &str, group: &str, kind: &str, values: Value) {
    let value = json!({
        "id": "resp",
        "transactionId": transaction_id,
        "inputGroupKey": group,
        "kind": kind,
        "values": values
    });
    peer.call(
        "IO_RESPONSE",
        json!({"transactionId": transaction_id, "value": value.to_string()}),
    );
}
