//! Relay CLI binary.
//!
//! # Commands
//!
//! - `serve` - Start the HTTP relay
//! - `extract` - Pull the assistant text out of a captured backend response
//! - `count` - Count tokens the way prompts are billed

use std::io::{self, Read};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use relay::{
    count_tokens_for_model,
    relay::{extract, CapturedResponse},
    Config, RelayServer, VERSION,
};

#[derive(Parser)]
#[command(name = "relay")]
#[command(version = VERSION)]
#[command(about = "Metered relay between OpenAI-style clients and LLM backends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP relay
    Serve {
        /// Config file (default: <config dir>/relay/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Verbose logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Extract assistant text from a captured response body
    Extract {
        /// Response body (or - for stdin)
        input: Option<String>,

        /// Input file path
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Treat the body as an SSE stream
        #[arg(short, long)]
        stream: bool,
    },

    /// Count tokens in text
    Count {
        /// Text (or - for stdin)
        input: Option<String>,

        /// Input file path
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Model whose encoding to use
        #[arg(short, long, default_value = "gpt-3.5-turbo")]
        model: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            host,
            port,
            verbose,
        } => cmd_serve(config, host, port, verbose),
        Commands::Extract {
            input,
            file,
            stream,
        } => cmd_extract(input, file, stream),
        Commands::Count { input, file, model } => cmd_count(input, file, &model),
    }
}

fn cmd_serve(
    path: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    verbose: bool,
) -> anyhow::Result<()> {
    let mut config = Config::load(path.as_deref())?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config.server.verbose |= verbose;

    // Initialize logging
    let log_level = if config.server.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    tracing::info!("Starting relay v{}", VERSION);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let server = RelayServer::new(config)?;
        server.run().await?;
        Ok::<_, anyhow::Error>(())
    })
}

fn cmd_extract(input: Option<String>, file: Option<PathBuf>, stream: bool) -> anyhow::Result<()> {
    let content = read_input(input, file)?;
    let captured = CapturedResponse {
        body: content.into(),
        is_stream: stream,
    };
    println!("{}", extract(&captured));
    Ok(())
}

fn cmd_count(input: Option<String>, file: Option<PathBuf>, model: &str) -> anyhow::Result<()> {
    let content = read_input(input, file)?;
    println!("{}", count_tokens_for_model(&content, model));
    Ok(())
}

fn read_input(input: Option<String>, file: Option<PathBuf>) -> anyhow::Result<String> {
    if let Some(path) = file {
        Ok(std::fs::read_to_string(path)?)
    } else if let Some(s) = input.filter(|s| s != "-") {
        Ok(s)
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    }
}
