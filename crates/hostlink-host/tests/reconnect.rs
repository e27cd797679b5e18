//! Connection lifecycle and replay across reconnects.

mod common;

use std::{sync::Arc, time::Duration};

use common::{
    accept_initialized, client, expect_call, io_response, listening, render_instruction,
    start_transaction,
};
use async_trait::async_trait;
use futures::StreamExt;
use hostlink_core::{ClientConfig, Envelope, InstanceId, RpcError};
use hostlink_host::{ActionError, Actions, ConnectionState, HostClient, HostError};
use hostlink_transport::{Connection, Connector, MemoryConnector, TransportError, memory_transport};
use serde_json::{Value, json};
use tokio::time::{Instant, timeout};
use tokio_test::assert_err;

async fn wait_for_state(client: &HostClient, target: ConnectionState) {
    let mut states = client.state_stream();
    while let Some(state) = states.next().await {
        if state == target {
            return;
        }
    }
    panic!("state stream ended before {target}");
}

fn form_action() -> Actions {
    Actions::new().with_fn("form", |io, _ctx| async move {
        let values = io.render(vec![json!({"methodName": "INPUT_TEXT", "label": "Name"})]).await?;
        Ok::<Value, ActionError>(Value::Array(values))
    })
}

#[tokio::test(start_paused = true)]
async fn submission_is_resent_once_after_reconnect() {
    let (client, mut remote) = client(form_action());
    let mut peer = listening(&client, &mut remote).await;
    let instance_id = client.instance_id();
    assert_eq!(peer.instance_id(), instance_id);

    start_transaction(&peer, "tx-a", "form");
    let io_call = expect_call(&mut peer, "SEND_IO_CALL").await;
    let group = render_instruction(&io_call).input_group_key;
    peer.reply_ok(&io_call, json!(true));

    // Acknowledged; nothing is resent while the socket is up.
    let quiet = timeout(Duration::from_secs(10), expect_call(&mut peer, "SEND_IO_CALL")).await;
    assert!(quiet.is_err());
    assert_eq!(client.pending_operations(), 1);

    peer.kill(1006, "network dropped");
    let mut peer = accept_initialized(&mut remote).await;
    assert_eq!(peer.instance_id(), instance_id);
    assert_eq!(client.instance_id(), instance_id);

    let resent = expect_call(&mut peer, "SEND_IO_CALL").await;
    assert_eq!(common::payload(&resent), common::payload(&io_call));
    peer.reply_ok(&resent, json!(true));

    io_response(&peer, "tx-a", &group, "RETURN", json!(["Ada"]));
    let complete = expect_call(&mut peer, "MARK_TRANSACTION_COMPLETE").await;
    let result: Value =
        serde_json::from_str(common::payload(&complete)["result"].as_str().unwrap()).unwrap();
    assert_eq!(result["status"], "SUCCESS");
    assert_eq!(result["data"], json!(["Ada"]));
    peer.reply_ok(&complete, json!(true));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.pending_operations(), 0);
    assert_eq!(client.active_transactions(), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_pings_force_reconnect_after_threshold() {
    let (client, mut remote) = client(Actions::new().with_fn("noop", |_, _| async { Ok(Value::Null) }));
    let peer = listening(&client, &mut remote).await;
    let connected_at = Instant::now();

    remote.set_answer_pings(false);
    remote.set_refuse(true);
    wait_for_state(&client, ConnectionState::Reconnecting).await;

    let elapsed = connected_at.elapsed();
    let threshold = client.config().unresponsive_timeout();
    assert!(elapsed > threshold, "closed too early: {elapsed:?}");
    assert!(
        elapsed <= threshold + client.config().ping_interval(),
        "closed too late: {elapsed:?}"
    );
    assert!(peer.is_closed());
    assert!(!client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn reconnect_keeps_retrying_until_service_returns() {
    let (client, mut remote) = client(Actions::new().with_fn("noop", |_, _| async { Ok(Value::Null) }));
    let peer = listening(&client, &mut remote).await;

    remote.set_refuse(true);
    peer.kill(1012, "service restart");
    wait_for_state(&client, ConnectionState::Reconnecting).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    let attempts = remote.connect_attempts();
    assert!(attempts > 5, "only {attempts} attempts");

    remote.set_refuse(false);
    let _peer = accept_initialized(&mut remote).await;
    wait_for_state(&client, ConnectionState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn first_connect_failure_surfaces_without_retry() {
    let (client, remote) = client(Actions::new().with_fn("noop", |_, _| async { Ok(Value::Null) }));
    remote.set_refuse(true);

    let err = assert_err!(client.listen().await);
    assert!(matches!(err, HostError::Transport(TransportError::Connect(_))));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(remote.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn intentional_close_does_not_reconnect() {
    let (client, mut remote) = client(Actions::new().with_fn("noop", |_, _| async { Ok(Value::Null) }));
    let peer = listening(&client, &mut remote).await;

    client.close().await;
    client.close().await;
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(peer.is_closed());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(remote.connect_attempts(), 1);
    assert!(matches!(client.listen().await, Err(HostError::Closed)));
}

#[tokio::test(start_paused = true)]
async fn unanswered_calls_are_retried_on_the_new_socket() {
    let (client, mut remote) = client(Actions::new().with_fn("logger", |_, ctx| async move {
        ctx.log("before the drop");
        Ok(Value::Null)
    }));
    let mut peer = listening(&client, &mut remote).await;

    start_transaction(&peer, "tx-l", "logger");
    // Read both calls but never answer them; the socket drops instead.
    let mut first = Vec::new();
    while first.len() < 2 {
        let call = peer.recv().await.unwrap();
        if matches!(call, Envelope::Call { .. }) {
            first.push(call.method().to_string());
        }
    }
    first.sort();
    assert_eq!(first, ["MARK_TRANSACTION_COMPLETE", "SEND_LOG"]);
    peer.kill(1006, "gone");

    let mut peer = accept_initialized(&mut remote).await;
    let mut retried = Vec::new();
    while retried.len() < 2 {
        let call = peer.recv().await.unwrap();
        if matches!(call, Envelope::Call { .. }) {
            retried.push(call.method().to_string());
            peer.reply_ok(&call, json!(true));
        }
    }
    retried.sort();
    assert_eq!(retried, first);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.active_transactions(), 0);
}

#[tokio::test(start_paused = true)]
async fn close_fails_running_units_and_pending_requests() {
    let (rendered_tx, mut rendered) = tokio::sync::mpsc::unbounded_channel();
    let actions = Actions::new().with_fn("form", move |io, _ctx| {
        let rendered_tx = rendered_tx.clone();
        async move {
            let result = io.render(vec![json!({"label": "Name"})]).await;
            let _ = rendered_tx.send(result.clone());
            Ok::<Value, ActionError>(Value::Array(result?))
        }
    });
    let (client, mut remote) = client(actions);

    let request = {
        let client = client.clone();
        tokio::spawn(async move { client.respond_to_request("req-1").await })
    };
    let mut peer = accept_initialized(&mut remote).await;
    start_transaction(&peer, "tx-q", "form");
    let io_call = expect_call(&mut peer, "SEND_IO_CALL").await;
    peer.reply_ok(&io_call, json!(true));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.active_transactions(), 1);

    client.close().await;

    let outcome = timeout(Duration::from_secs(5), request).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(HostError::Rpc(RpcError::NotConnected))));
    assert_eq!(rendered.recv().await, Some(Err(RpcError::TransactionClosed)));
    assert_eq!(client.active_transactions(), 0);
    assert_eq!(client.pending_operations(), 0);
}

/// Yields to the scheduler before opening the socket, like a real handshake.
struct SlowConnector {
    inner: MemoryConnector,
}

#[async_trait]
impl Connector for SlowConnector {
    async fn connect(&self, instance_id: InstanceId) -> Result<Connection, TransportError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.inner.connect(instance_id).await
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_first_connects_share_one_socket() {
    let (connector, mut remote) = memory_transport();
    let client = HostClient::with_connector(
        ClientConfig::default(),
        Actions::new().with_fn("noop", |_, _| async { Ok(Value::Null) }),
        Arc::new(SlowConnector { inner: connector }),
    )
    .unwrap();

    let listeners: Vec<_> = (0..2)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.listen().await })
        })
        .collect();

    let mut peer = remote.accept().await.unwrap();
    for _ in 0..2 {
        let init = expect_call(&mut peer, "INITIALIZE_HOST").await;
        peer.reply_ok(&init, common::init_success());
    }
    for listener in listeners {
        listener.await.unwrap().unwrap();
    }

    assert_eq!(remote.connect_attempts(), 1);
    assert!(timeout(Duration::from_secs(1), remote.accept()).await.is_err());
    assert!(client.is_connected());
}
