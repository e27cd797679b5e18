//! Example host serving a single action.
//!
//! Run with: HOSTLINK_API_KEY=... cargo run -p host-demo
//!
//! Connection settings come from `HOSTLINK_*` environment variables.

use anyhow::Context as _;
use futures::StreamExt;
use hostlink_core::{ClientConfig, LoadingState};
use hostlink_host::{ActionContext, ActionError, Actions, HostClient, IoClient};
use serde_json::{Value, json};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn greet(io: IoClient, ctx: ActionContext) -> Result<Value, ActionError> {
    ctx.log(format_args!("started by {}", ctx.user.email));
    ctx.loading
        .update(LoadingState {
            title: Some("Preparing form".into()),
            ..LoadingState::default()
        })
        .await?;

    let values = io
        .render(vec![json!({
            "methodName": "INPUT_TEXT",
            "label": "Who should we greet?"
        })])
        .await?;
    let name = values
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| ActionError::failed("expected a name"))?;

    ctx.log(format_args!("greeting {name}"));
    Ok(json!({ "greeting": format!("Hello, {name}!") }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut config = ClientConfig::default();
    config.apply_env_overrides();

    let actions = Actions::new().with_fn("greet", greet);
    let client = HostClient::new(config, actions).context("invalid host configuration")?;

    let mut states = client.state_stream();
    tokio::spawn(async move {
        while let Some(state) = states.next().await {
            tracing::info!(%state, "connection state");
        }
    });

    client.listen().await.context("failed to start host")?;
    tracing::info!(instance_id = %client.instance_id(), "host listening, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    client.close().await;
    Ok(())
}
