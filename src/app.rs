use crate::cli::BridgeCommand;
use crate::error::GenerateError;
use crate::provider::{self, Provider};
use crate::{config, paths};
use anyhow::Context;

pub fn cmd_bridge(cmd: BridgeCommand) -> anyhow::Result<()> {
    let path = paths::bridge_config_path()?;
    match cmd {
        BridgeCommand::Init { force } => {
            if provider::bridge::init_default(&path, force)? {
                println!("Wrote default bridge config to: {}", path.display());
            } else {
                println!(
                    "Bridge config already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
        }
        BridgeCommand::Path => println!("{}", path.display()),
        BridgeCommand::Check => {
            let cfg = provider::bridge::BridgeConfig::load(&path)?;
            cfg.header_map()?;
            cfg.render_body("")?;
            println!(
                "{}: POST {} ({} headers), extracting \"{}\"",
                path.display(),
                cfg.url,
                cfg.headers.len(),
                cfg.field_to_extract
            );
        }
    }
    Ok(())
}

pub fn build_provider(
    http: &reqwest::Client,
    cfg: Option<&config::Config>,
    provider_name: &str,
    model_override: Option<String>,
) -> anyhow::Result<Box<dyn Provider + Send + Sync>> {
    let model = model_override.or_else(|| cfg.and_then(|c| c.model.clone()));

    match provider_name {
        "google" => {
            #[cfg(feature = "google")]
            {
                let api_key = std::env::var("GEMINI_API_KEY")
                    .ok()
                    .or_else(|| cfg.and_then(|c| c.google.api_key.clone()))
                    .ok_or_else(|| {
                        GenerateError::MissingCredentials(
                            "No Gemini API key found. Set GEMINI_API_KEY or google.api_key in config.toml \
                             (keys: https://aistudio.google.com/app/apikey)"
                                .to_string(),
                        )
                    })?;
                let model = model
                    .or_else(|| cfg.and_then(|c| c.google.model.clone()))
                    .unwrap_or_else(|| provider::google::DEFAULT_MODEL.to_string());

                let p = provider::google::GoogleProvider::new(http.clone(), api_key, model)?;
                Ok(Box::new(p))
            }
            #[cfg(not(feature = "google"))]
            {
                let _ = http;
                anyhow::bail!("google provider is not enabled in this build")
            }
        }
        "ollama" => {
            let base_url = cfg
                .and_then(|c| c.ollama.base_url.clone())
                .unwrap_or_else(|| provider::ollama::DEFAULT_BASE_URL.to_string());
            let model = model
                .or_else(|| cfg.and_then(|c| c.ollama.model.clone()))
                .unwrap_or_else(|| provider::ollama::DEFAULT_MODEL.to_string());

            let p = provider::ollama::OllamaProvider::new(http.clone(), &base_url, model)
                .with_context(|| format!("invalid ollama base_url: {base_url}"))?;
            Ok(Box::new(p))
        }
        "bridge" => {
            let path = paths::bridge_config_path()?;
            Ok(Box::new(provider::bridge::BridgeProvider::new(http.clone(), path)))
        }
        other => anyhow::bail!("unknown provider: {other}"),
    }
}
