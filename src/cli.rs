use clap::{Parser, Subcommand};

/// Stream answers from Gemini, a local Ollama daemon, or any JSON endpoint
#[derive(Debug, Parser)]
#[command(name = "relay")]
#[command(version)]
#[command(about = "Stream LLM answers to the terminal", long_about = None)]
pub struct Args {
    /// Model name (Gemini or Ollama)
    #[arg(short = 'm', long = "model")]
    pub model: Option<String>,

    /// Provider: google, ollama or bridge (default: config/provider or "google")
    #[arg(long = "provider")]
    pub provider: Option<String>,

    /// Use the local Ollama daemon
    #[arg(short = 'l', long = "local", conflicts_with = "remote")]
    pub local: bool,

    /// Use the configurable bridge endpoint (remote_config.json)
    #[arg(short = 'r', long = "remote")]
    pub remote: bool,

    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// Prompt text (positional) (used when no subcommand is given)
    #[arg(value_name = "PROMPT")]
    pub prompt: Vec<String>,
}

impl Args {
    /// Provider picked by flags alone, if any.
    pub fn provider_override(&self) -> Option<String> {
        if self.local {
            Some("ollama".to_string())
        } else if self.remote {
            Some("bridge".to_string())
        } else {
            self.provider.clone()
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage the bridge endpoint description
    Bridge {
        #[command(subcommand)]
        cmd: BridgeCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum BridgeCommand {
    /// Write the default remote_config.json
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print where remote_config.json lives
    Path,
    /// Load and validate remote_config.json without sending anything
    Check,
}
