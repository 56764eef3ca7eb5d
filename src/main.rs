//! Command-line front end for the speech pipeline.
//!
//! Reads an AI reply (the model's JSON payload) from the file named by the
//! first argument, or from stdin when no argument is given, renders speech
//! and lip-sync for every utterance and prints the response body to stdout.
//!
//! Configuration comes from the environment (see `config.rs`); a `.env`
//! file in the working directory is loaded first. `CONVERSATION_ID` names
//! the scratch subdirectory used for this run (default `cli`). Ctrl-C
//! cancels an in-flight render.

use std::env;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use avatar_voice::{spawn_sweeper, PipelineConfig, SpeechPipeline};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from `.env` if present.
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = PipelineConfig::from_env();
    let conversation_id = env::var("CONVERSATION_ID").unwrap_or_else(|_| "cli".to_string());
    let sweep_interval = config.sweep_interval;
    let max_file_age = config.max_file_age;

    let pipeline = SpeechPipeline::from_config(config)?;
    let shutdown = CancellationToken::new();

    // Leaked scratch files are swept out of band, never on the request path.
    let sweeper = spawn_sweeper(
        pipeline.workspace(),
        sweep_interval,
        max_file_age,
        shutdown.clone(),
    );

    // Handle Ctrl-C (SIGINT) by cancelling the current render.
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
            return;
        }
        log::info!("Received Ctrl-C, cancelling");
        on_signal.cancel();
    });

    let payload = read_payload().await?;
    let result = pipeline.render(&payload, &conversation_id, &shutdown).await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        log::error!("Scratch sweeper task failed: {e}");
    }

    let reply = result.context("speech rendering did not complete")?;
    println!("{}", reply.to_body());
    Ok(())
}

async fn read_payload() -> Result<String> {
    match env::args().nth(1) {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read AI reply from {path}")),
        None => {
            let mut payload = String::new();
            tokio::io::stdin()
                .read_to_string(&mut payload)
                .await
                .context("failed to read AI reply from stdin")?;
            Ok(payload)
        }
    }
}
