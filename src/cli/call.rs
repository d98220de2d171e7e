// ABOUTME: Diagnostic call command: one payload through the running broker
//
// Connects to the front address like a worker would, sends the payload and
// prints the reply (or the failure) as JSON on stdout.

use anyhow::{Context, Result, anyhow};
use serde_json::Value;

use super::CallArgs;
use skyline::client::{BrokerClient, CallError};
use skyline::config::SkylineConfig;

pub async fn execute(args: CallArgs, config: SkylineConfig) -> Result<()> {
    let payload: Value =
        serde_json::from_str(&args.payload).context("Payload is not valid JSON")?;

    let front = config.broker.front_path()?;
    let client = BrokerClient::connect(&front, &config.broker)
        .await
        .context("Is `skyline serve` running?")?;

    let result = client.call(payload).await;
    client.close().await;

    match result {
        Ok(reply) => {
            println!("{}", serde_json::to_string_pretty(&reply)?);
            Ok(())
        }
        Err(CallError::Remote(error)) => {
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "error": error }))?);
            Err(anyhow!("Call failed remotely"))
        }
        Err(e) => Err(e.into()),
    }
}
