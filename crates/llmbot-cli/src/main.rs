use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use llmbot_config::RelayConfig;
use llmbot_relay::{ChatOptions, Dispatcher, Observer};

mod cli;

use cli::Cli;

/// Part of `current` not yet printed, given what was printed so far
///
/// A reply that stopped extending the printed text (the backend replaced it)
/// is printed again in full on a new line.
fn unprinted<'a>(printed: &str, current: &'a str) -> (bool, &'a str) {
    match current.strip_prefix(printed) {
        Some(rest) => (false, rest),
        None => (true, current),
    }
}

/// Observer printing each update's new suffix to stdout
fn printer(printed: Arc<Mutex<String>>) -> Observer {
    Arc::new(move |text: &str| {
        let Ok(mut printed) = printed.lock() else {
            return;
        };
        let (restart, rest) = unprinted(&printed, text);
        if restart {
            println!();
        }
        print!("{rest}");
        flush_stdout();
        *printed = text.to_string();
    })
}

/// Helper to flush stdout without panicking
fn flush_stdout() {
    if let Err(e) = std::io::stdout().flush() {
        debug!("Failed to flush stdout: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(cli.log_filter()))
        .with_writer(std::io::stderr)
        .init();

    let mut config = RelayConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(model) = cli.model.clone() {
        config.dispatcher.default_model = Some(model);
    }
    let dispatcher = Dispatcher::from_config(&config).context("building backends")?;
    info!(model = %config.dispatcher.default_model(), "relay ready");

    println!("Chatting with {}. Type /list for models, an empty line to quit.", config.dispatcher.default_model());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("You: ");
        flush_stdout();
        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            break;
        }

        print!("Bot: ");
        flush_stdout();
        let printed = Arc::new(Mutex::new(String::new()));
        let options = ChatOptions::default().on_message(printer(printed.clone()));
        let reply = dispatcher.chat(&line, options).await;

        let printed = printed.lock().map(|p| p.clone()).unwrap_or_default();
        let (restart, rest) = unprinted(&printed, &reply);
        if restart && !printed.is_empty() {
            println!();
        }
        println!("{rest}");
    }

    Ok(())
}
