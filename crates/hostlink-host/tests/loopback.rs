//! End to end over a real WebSocket against the loopback server.

use std::time::Duration;

use hostlink_core::{ClientConfig, Envelope, IoRenderInstruction};
use hostlink_host::{ActionError, Actions, ConnectionState, HostClient};
use hostlink_transport::{LoopbackServer, RemoteSocket};
use serde_json::{Value, json};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn next_call(socket: &mut RemoteSocket, method: &str) -> Envelope {
    loop {
        let envelope = timeout(WAIT, socket.recv()).await.unwrap().unwrap();
        if matches!(envelope, Envelope::Call { .. }) {
            assert_eq!(envelope.method(), method);
            return envelope;
        }
    }
}

fn call_payload(call: &Envelope) -> &Value {
    let Envelope::Call { payload, .. } = call else {
        panic!("expected a call");
    };
    payload
}

#[tokio::test]
async fn host_serves_a_form_over_websocket() {
    let mut server = LoopbackServer::bind().await.unwrap();
    let config = ClientConfig::new(server.endpoint())
        .with_api_key("live_key")
        .with_retry_interval(Duration::from_millis(100));
    let actions = Actions::new().with_fn("greet", |io, ctx| async move {
        ctx.log("rendering greeting form");
        let values = io.render(vec![json!({"methodName": "INPUT_TEXT", "label": "Name"})]).await?;
        Ok::<Value, ActionError>(json!({"greeting": format!("Hello, {}", values[0].as_str().unwrap_or(""))}))
    });
    let client = HostClient::new(config, actions).unwrap();

    let listener = {
        let client = client.clone();
        tokio::spawn(async move { client.listen().await })
    };
    let mut socket = timeout(WAIT, server.accept()).await.unwrap().unwrap();
    assert_eq!(socket.instance_id, Some(client.instance_id().to_string()));
    assert_eq!(socket.api_key.as_deref(), Some("live_key"));

    let init = next_call(&mut socket, "INITIALIZE_HOST").await;
    socket.reply_ok(
        &init,
        json!({
            "type": "success",
            "environment": "live",
            "organization": {"name": "Acme", "slug": "acme"},
            "dashboardUrl": "http://localhost/dashboard/acme"
        }),
    );
    timeout(WAIT, listener).await.unwrap().unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    socket.call(
        "START_TRANSACTION",
        json!({
            "transactionId": "tx-ws",
            "actionName": "greet",
            "environment": "live",
            "user": {"email": "ada@example.com", "firstName": "Ada"},
            "params": {}
        }),
    );

    let mut group = None;
    let mut saw_log = false;
    while group.is_none() || !saw_log {
        let call = timeout(WAIT, socket.recv()).await.unwrap().unwrap();
        if !matches!(call, Envelope::Call { .. }) {
            continue;
        }
        match call.method() {
            "SEND_LOG" => {
                assert_eq!(call_payload(&call)["index"], 0);
                saw_log = true;
            }
            "SEND_IO_CALL" => {
                let text = call_payload(&call)["ioCall"].as_str().unwrap();
                let render: IoRenderInstruction = serde_json::from_str(text).unwrap();
                group = Some(render.input_group_key);
            }
            other => panic!("unexpected call {other}"),
        }
        socket.reply_ok(&call, json!(true));
    }

    let response = json!({
        "id": "resp-1",
        "transactionId": "tx-ws",
        "inputGroupKey": group,
        "kind": "RETURN",
        "values": ["Ada"]
    });
    socket.call(
        "IO_RESPONSE",
        json!({"transactionId": "tx-ws", "value": response.to_string()}),
    );

    let complete = next_call(&mut socket, "MARK_TRANSACTION_COMPLETE").await;
    let result: Value =
        serde_json::from_str(call_payload(&complete)["result"].as_str().unwrap()).unwrap();
    assert_eq!(result["status"], "SUCCESS");
    assert_eq!(result["data"], json!({"greeting": "Hello, Ada"}));
    socket.reply_ok(&complete, json!(true));

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn host_reconnects_to_restarted_socket() {
    let mut server = LoopbackServer::bind().await.unwrap();
    let config = ClientConfig::new(server.endpoint()).with_retry_interval(Duration::from_millis(50));
    let actions = Actions::new().with_fn("noop", |_, _| async { Ok(Value::Null) });
    let client = HostClient::new(config, actions).unwrap();
    let success = json!({
        "type": "success",
        "environment": "development",
        "organization": {"name": "Acme", "slug": "acme"},
        "dashboardUrl": "http://localhost/dashboard/acme"
    });

    let listener = {
        let client = client.clone();
        tokio::spawn(async move { client.listen().await })
    };
    let mut socket = timeout(WAIT, server.accept()).await.unwrap().unwrap();
    let init = next_call(&mut socket, "INITIALIZE_HOST").await;
    socket.reply_ok(&init, success.clone());
    timeout(WAIT, listener).await.unwrap().unwrap().unwrap();

    socket.close(4000, "server restarting");
    let mut socket = timeout(WAIT, server.accept()).await.unwrap().unwrap();
    assert_eq!(socket.instance_id, Some(client.instance_id().to_string()));
    let init = next_call(&mut socket, "INITIALIZE_HOST").await;
    socket.reply_ok(&init, success);

    client.close().await;
}
