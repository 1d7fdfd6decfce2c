use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use docrelay::config::{Config, config};
use docrelay::sink::{self, FilePicker, GlobFilePicker};
use docrelay::{DocumentSink, ExchangeReport, RelayClient, RelayError, TextDocument, WsConnector};
use docrelay::logging;

#[derive(Parser, Debug)]
#[command(name = "docrelay")]
#[command(version = env!("DOCRELAY_VERSION"))]
#[command(about = "Relay prompts to a local AI backend and stream the answer into a document")]
struct Args {
    /// Backend endpoint (overrides config and DOCRELAY_URL)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Log debug output and raw wire payloads
    #[arg(long, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze source files
    Ask {
        /// What to ask
        prompt: String,

        /// Files to send along (glob patterns, repeatable)
        #[arg(short, long = "file")]
        files: Vec<String>,

        /// File the question is about
        #[arg(long)]
        current_file: Option<String>,

        /// Append the answer to this file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Ask for a single reply instead of a stream
        #[arg(long)]
        no_stream: bool,
    },

    /// Explain code in the context of the current file (streamed)
    Explain {
        prompt: String,

        #[arg(long)]
        current_file: Option<String>,

        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Check that the backend is reachable and healthy
    Health,

    /// Print the conversation history kept by the backend
    History,

    /// Show the effective configuration
    Config {
        /// Write a commented default config file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    logging::cleanup_old_logs();
    logging::info(&format!("docrelay {} starting", env!("DOCRELAY_VERSION")));

    let args = Args::parse();
    if args.trace {
        logging::set_trace(true);
    }

    if let Err(e) = run_main(args).await {
        logging::error(&format!("{:?}", e));
        return Err(e);
    }
    Ok(())
}

async fn run_main(args: Args) -> Result<()> {
    let mut config = config().clone();
    if let Some(url) = args.url {
        config.backend.url = url;
    }

    match args.command {
        Command::Config { init } => {
            if init {
                let path = Config::create_default_config_file()?;
                println!("Wrote {}", path.display());
            } else {
                println!("{}", config.display_string());
                if let Some(log) = logging::log_path() {
                    println!("\nLog: {}", log.display());
                }
            }
            Ok(())
        }
        Command::Health => {
            let mut client = RelayClient::from_config(WsConnector, &config);
            let cancel = cancel_on_ctrl_c();
            let result = client.health(&cancel).await;
            client.close().await;
            let status = result.with_context(|| format!("{} is not healthy", config.backend.url))?;
            println!("{}: {}", config.backend.url, status);
            Ok(())
        }
        Command::History => {
            let mut client = RelayClient::from_config(WsConnector, &config);
            let cancel = cancel_on_ctrl_c();
            let result = client.refresh_history(&cancel).await.map(|e| e.to_vec());
            client.close().await;
            let entries = result.context("Failed to refresh history")?;
            if entries.is_empty() {
                println!("(no history)");
            }
            for entry in entries {
                println!("[{}] {}: {}", entry.timestamp, entry.role, entry.message);
            }
            Ok(())
        }
        Command::Ask {
            prompt,
            files,
            current_file,
            out,
            no_stream,
        } => {
            if no_stream {
                config.backend.stream = false;
            }
            let files = pick_files(files)?;
            let mut doc = open_document(out);
            let mut client = RelayClient::from_config(WsConnector, &config);
            let cancel = cancel_on_ctrl_c();
            let result = client
                .ask(&prompt, &files, current_file.as_deref(), doc.as_mut(), &cancel)
                .await;
            client.close().await;
            finish(result)
        }
        Command::Explain {
            prompt,
            current_file,
            out,
        } => {
            let mut doc = open_document(out);
            let mut client = RelayClient::from_config(WsConnector, &config);
            let cancel = cancel_on_ctrl_c();
            let result = client
                .explain(&prompt, current_file.as_deref(), doc.as_mut(), &cancel)
                .await;
            client.close().await;
            finish(result)
        }
    }
}

fn pick_files(patterns: Vec<String>) -> Result<Vec<String>> {
    let mut picker = GlobFilePicker::new(patterns);
    match picker.pick_files(&sink::default_filters()) {
        Ok(paths) => Ok(paths
            .iter()
            .map(|p| p.display().to_string())
            .collect()),
        // Nothing selected: ask without files
        Err(RelayError::Cancelled) => Ok(Vec::new()),
        Err(e) => Err(e).context("File selection failed"),
    }
}

fn open_document(out: Option<PathBuf>) -> Box<dyn DocumentSink> {
    match out {
        Some(path) => Box::new(TextDocument::file(path)),
        None => Box::new(TextDocument::stdout()),
    }
}

fn finish(result: docrelay::Result<ExchangeReport>) -> Result<()> {
    match result {
        Ok(report) => {
            println!();
            logging::info(&format!(
                "Request {} wrote {} chars",
                report.request_id, report.chars_written
            ));
            Ok(())
        }
        Err(RelayError::Cancelled) => {
            eprintln!("\nCancelled.");
            Ok(())
        }
        Err(e) => Err(e).context("Request failed"),
    }
}

/// Cancellation token tripped by the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            logging::info("Ctrl-C received, cancelling");
            trigger.cancel();
        }
    });
    cancel
}
