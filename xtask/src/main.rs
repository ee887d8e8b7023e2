use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use newsdesk_core::api::MockBackend;
use newsdesk_core::client::{ChatClient, ClientOptions, SendOptions};
use newsdesk_core::store::SessionStore;
use newsdesk_core::telemetry;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Newsdesk")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a lightweight smoke test that exercises the Newsdesk client against the mock backend.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let temp_dir = TempDir::new()?;
    let store = SessionStore::new(temp_dir.path().to_path_buf());
    let client = ChatClient::new(Arc::new(MockBackend::new()), ClientOptions::default())
        .with_store(store.clone());

    runtime.block_on(async {
        let session_id = client.resume_or_create().await?;
        info!(%session_id, "smoke session created");
        client.send("ping from xtask", SendOptions::default()).await?;
        let outcome = client
            .send("streamed ping from xtask", SendOptions::streaming())
            .await?;
        info!(transport = ?outcome.transport, "streamed answer finished");
        anyhow::Ok(())
    })?;

    let persisted = store.load_messages()?;
    if persisted.len() != 4 {
        bail!("expected 4 persisted messages, found {}", persisted.len());
    }
    info!(
        "messages" = persisted.len(),
        "smoke test conversation saved"
    );

    Ok(())
}
