use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use newsdesk::{send_options, NewsdeskApp, Transcript};
use newsdesk_core::api::{ChatBackend, HttpBackend, MockBackend};
use newsdesk_core::client::{ChatClient, ClientOptions, SendOptions};
use newsdesk_core::config::ClientSettings;
use newsdesk_core::push::{ReconnectPolicy, WsPushChannel};
use newsdesk_core::store::SessionStore;
use newsdesk_core::telemetry;
use newsdesk_core::transport::{ConnectionState, SendMode};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "newsdesk", version, about = "Chat with the Newsdesk news assistant")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    #[arg(long, env = "NEWSDESK_API_BASE_URL")]
    api_base_url: Option<String>,
    #[arg(long, env = "NEWSDESK_SOCKET_URL")]
    socket_url: Option<String>,
    /// Never open the push channel.
    #[arg(long)]
    no_push: bool,
    /// Request answers as a chunked stream.
    #[arg(long)]
    stream: bool,
    /// Answer locally without a backend.
    #[arg(long)]
    mock: bool,
    /// Ignore the persisted session.
    #[arg(long)]
    fresh: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask a single question and print the answer.
    Ask { question: Vec<String> },
    /// Print backend statistics.
    Stats,
    /// Print the history of the persisted session.
    History,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing(telemetry::env_filter_or("warn"))?;

    let cli = Cli::parse();
    let mut settings = ClientSettings::load().map_err(|err| anyhow!(err.user_message()))?;
    settings
        .apply_overrides(cli.api_base_url.clone(), cli.socket_url.clone())
        .map_err(|err| anyhow!(err.user_message()))?;
    if cli.no_push || cli.mock {
        settings.socket_url = None;
    }
    if cli.stream {
        settings.default_mode = SendMode::Streaming;
    }

    let runtime = Runtime::new()?;
    runtime.block_on(run(cli, settings))
}

async fn run(cli: Cli, settings: ClientSettings) -> anyhow::Result<()> {
    let backend: Arc<dyn ChatBackend> = if cli.mock {
        Arc::new(MockBackend::new())
    } else {
        Arc::new(
            HttpBackend::new(settings.api_base_url.clone(), settings.request_timeout)
                .map_err(|err| anyhow!(err.user_message()))?,
        )
    };
    let mut client = ChatClient::new(backend, ClientOptions::from(&settings))
        .with_store(SessionStore::default_location());

    if let Some(url) = settings.socket_url.clone() {
        let channel = WsPushChannel::spawn(
            url.clone(),
            ReconnectPolicy {
                attempts: settings.reconnect_attempts,
                delay: settings.reconnect_delay,
            },
        );
        let state = channel.wait_settled(Duration::from_secs(5)).await;
        if state != ConnectionState::Connected {
            warn!(%url, ?state, "push channel unavailable, using HTTP");
        }
        client = client.with_push(Arc::new(channel));
    }

    let session_id = if cli.fresh {
        client.create_session().await
    } else {
        client.resume_or_create().await
    }
    .map_err(|err| anyhow!(err.user_message()))?;
    info!(%session_id, "session ready");

    match cli.command {
        Some(Command::Ask { question }) => {
            ask(&client, &question.join(" "), send_options(&settings)).await
        }
        Some(Command::Stats) => {
            let stats = client
                .stats()
                .await
                .map_err(|err| anyhow!(err.user_message()))?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Some(Command::History) => {
            let mut transcript = Transcript::new(std::io::stdout());
            for message in client.messages() {
                transcript.message(&message)?;
            }
            Ok(())
        }
        None => {
            NewsdeskApp::new(client, &settings).run().await
        }
    }
}

async fn ask(client: &ChatClient, question: &str, options: SendOptions) -> anyhow::Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let options = options.with_progress(tx);

    let send = client.send(question, options);
    tokio::pin!(send);
    let mut transcript = Transcript::new(std::io::stdout());
    let result = loop {
        tokio::select! {
            result = &mut send => break result,
            Some(event) = rx.recv() => transcript.render(&event)?,
        }
    };
    while let Ok(event) = rx.try_recv() {
        transcript.render(&event)?;
    }
    result
        .map(|_| ())
        .map_err(|err| anyhow!(err.user_message()))
        .context("question was not answered")
}
