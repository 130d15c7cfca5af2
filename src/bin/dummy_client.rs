use anyhow::Result;
use serde_json::json;
use wsrpc_lite::{CallSpec, ClientConfig, StreamUpdate, WsrpcClient};

/// Demo consumer for a wsrpc server: one call, one call batch, one
/// stream. Owns no protocol state; everything arrives through the
/// client's typed handles.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let endpoint =
        std::env::var("WSRPC_ENDPOINT").unwrap_or_else(|_| "localhost:8080/kafka/ws".to_string());
    let disable_ws = std::env::var("WSRPC_DISABLE_WEBSOCKET").is_ok();

    println!("Connecting to {endpoint} (websocket {})", if disable_ws { "off" } else { "on" });

    let client = WsrpcClient::new(
        ClientConfig::new(&endpoint).with_websocket_disabled(disable_ws),
    )?;

    let square = client
        .call(CallSpec::new("square").with_params(json!(7)))
        .await?;
    match square.await {
        Ok(envelope) => println!("square(7) -> {:?}", envelope.result),
        Err(e) => eprintln!("square failed: {e}"),
    }

    let adds = client
        .call_batch(vec![
            CallSpec::new("add").with_params(json!([1, 2])),
            CallSpec::new("add").with_params(json!([30, 4])),
        ])
        .await?;
    for handle in adds {
        let id = handle.id();
        match handle.await {
            Ok(envelope) => println!("add #{id} -> {:?}", envelope.result),
            Err(e) => eprintln!("add #{id} failed: {e}"),
        }
    }

    let mut countdown = client
        .stream(CallSpec::new("countdown").with_params(json!(5)))
        .await?;
    while let Some(update) = countdown.next_update().await {
        match update {
            StreamUpdate::Event(envelope) => println!("countdown: {:?}", envelope.result),
            StreamUpdate::Error(err) => eprintln!("countdown error: {err}"),
            StreamUpdate::Complete(_) => {
                println!("countdown done");
                break;
            }
        }
    }

    Ok(())
}
