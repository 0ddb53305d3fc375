use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "llmbot")]
#[command(about = "llmbot - chat with Bing, Poe, Slack, Gradio spaces and more from one prompt")]
#[command(version)]
pub struct Cli {
    /// Config file path (defaults to ~/.config/llmbot/config.toml)
    #[arg(short = 'C', long)]
    pub config: Option<PathBuf>,

    /// Model to start with (overrides the config file)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// `EnvFilter` directive for the relay crates
    pub fn log_filter(&self) -> String {
        let level = if self.verbose { "debug" } else { "warn" };
        format!("llmbot_relay={level},llmbot_cli={level}")
    }
}
