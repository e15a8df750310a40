mod app;
mod cli;
mod config;
mod error;
mod json_template;
mod paths;
mod prompt;
mod provider;

use anyhow::Context;
use clap::Parser;
use error::GenerateError;
use provider::{GenerationStream, Provider};
use std::io::Write;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match run().await {
        Ok(Outcome::Complete) => ExitCode::SUCCESS,
        Ok(Outcome::Cancelled) => {
            eprintln!("(cancelled)");
            // Conventional status for a run stopped by SIGINT.
            ExitCode::from(130)
        }
        Err(err) => {
            // Setup problems get the actionable message alone, not a cause chain.
            match err.downcast_ref::<GenerateError>() {
                Some(setup) if setup.is_setup() => eprintln!("{setup}"),
                _ => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

/// How a run that did not error ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Complete,
    Cancelled,
}

async fn run() -> anyhow::Result<Outcome> {
    let args = cli::Args::parse();

    if let Some(cli::Command::Bridge { cmd }) = args.cmd {
        app::cmd_bridge(cmd)?;
        return Ok(Outcome::Complete);
    }

    let config_path = paths::app_config_path()?;
    let cfg = config::Config::load_optional(&config_path)?;
    tracing::debug!(?config_path, ?cfg, "resolved config");

    let piped = prompt::read_piped_stdin()?;
    let prompt = prompt::compose(&args.prompt, piped.as_deref());

    let provider_name = args
        .provider_override()
        .or_else(|| cfg.as_ref().and_then(|c| c.provider.clone()))
        .unwrap_or_else(|| "google".to_string());

    let http = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let provider = app::build_provider(&http, cfg.as_ref(), &provider_name, args.model.clone())?;
    tracing::debug!(provider = provider.name(), "selected provider");

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let stream = provider.generate(prompt, cancel.clone()).await?;
    render(stream, &mut std::io::stdout(), &cancel).await
}

/// Append each chunk to `out` as it arrives; a final newline marks the end.
async fn render(
    mut stream: GenerationStream,
    out: &mut impl Write,
    cancel: &CancellationToken,
) -> anyhow::Result<Outcome> {
    use tokio_stream::StreamExt;

    while let Some(item) = stream.next().await {
        let chunk = item.context("stream interrupted")?;
        write!(out, "{}", chunk.text)?;
        out.flush()?;
    }
    writeln!(out)?;
    out.flush()?;
    let state = stream.state();
    tracing::debug!(?state, terminal = state.is_terminal(), "generation finished");

    Ok(if cancel.is_cancelled() {
        Outcome::Cancelled
    } else {
        Outcome::Complete
    })
}
