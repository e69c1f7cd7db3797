//! Send one generation request and print the response as it streams.
//!
//! Reads the API key from the variable named by `api_key_env` in the config
//! (default `FERRY_API_KEY`). Retry notices go to stderr; Ctrl-C stops the
//! stream and keeps what was already printed.
//!
//! # Examples
//!
//! ```sh
//! # Basic streamed request
//! ferry --user "Explain exponential backoff in two sentences"
//!
//! # System prompt, model and conversation history
//! ferry --system "You are terse." --history history.json \
//!   --user "And the second point?" --model google/gemini-2.5-pro
//!
//! # Pipe content from stdin
//! cat draft.md | ferry --system "Rewrite this as a native speaker." --stdin
//!
//! # Ask about an image
//! ferry --user "What is in this picture?" --attach photo.jpg
//!
//! # JSON mode and image generation
//! ferry --user "List three colours as a JSON array under \"colours\"" --json
//! ferry --user "A lighthouse at dusk" --image lighthouse.png --aspect-ratio 16:9
//! ```

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process;

use clap::Parser;
use ferry::prelude::*;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Send one generation request and print the response.
#[derive(Parser)]
#[command(name = "ferry", version)]
struct Cli {
    // ── Message content ────────────────────────────────────────
    /// System instructions
    #[arg(long)]
    system: Option<String>,

    /// User message to send
    #[arg(long)]
    user: Option<String>,

    /// Read user content from stdin (appended after --user)
    #[arg(long)]
    stdin: bool,

    /// JSON file with prior turns: [{"role": "user"|"model", "text": "..."}]
    #[arg(long)]
    history: Option<PathBuf>,

    /// File to attach to the message (e.g. an image)
    #[arg(long)]
    attach: Option<PathBuf>,

    // ── Model selection ────────────────────────────────────────
    /// Model to use, overriding the configured one
    #[arg(long)]
    model: Option<String>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    // ── Capabilities ───────────────────────────────────────────
    /// Ground the answer with web search
    #[arg(long)]
    web_search: bool,

    /// Allow extended thinking
    #[arg(long)]
    thinking: bool,

    /// Maximum tokens in the response (0 = provider default)
    #[arg(long, default_value_t = 0)]
    max_tokens: u32,

    /// Sampling temperature
    #[arg(long)]
    temperature: Option<f32>,

    // ── Output mode ────────────────────────────────────────────
    /// Request a JSON object and pretty-print it
    #[arg(long, conflicts_with = "image")]
    json: bool,

    /// Generate an image and write it to this path
    #[arg(long)]
    image: Option<PathBuf>,

    /// Aspect ratio for --image
    #[arg(long, default_value = ferry::DEFAULT_ASPECT_RATIO)]
    aspect_ratio: String,

    /// Wait for the full response instead of streaming
    #[arg(long)]
    no_stream: bool,

    // ── Retry ──────────────────────────────────────────────────
    /// Attempts per call; the rate-limit budget is twice this
    #[arg(long)]
    max_attempts: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Config(#[from] ferry::config::ConfigError),
    #[error("{0}")]
    Call(#[from] ClassifiedError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

fn io_error(context: impl Into<String>) -> impl FnOnce(io::Error) -> CliError {
    let context = context.into();
    move |source| CliError::Io { context, source }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("FERRY_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> Result<FerryConfig, CliError> {
    let mut config = match &cli.config {
        Some(path) => FerryConfig::load(path)?,
        None => FerryConfig::from_env(),
    };
    if let Some(model) = &cli.model {
        config.model = model.clone();
        config.image_model = model.clone();
    }
    if let Some(attempts) = cli.max_attempts {
        let attempts = attempts.max(1);
        config.retry.max_attempts = attempts;
        config.retry.rate_limit_attempts = attempts.saturating_mul(2);
    }
    Ok(config)
}

fn read_input(cli: &Cli) -> Result<String, CliError> {
    let mut input = cli.user.clone().unwrap_or_default();
    if cli.stdin {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .map_err(io_error("failed to read stdin"))?;
        if !input.is_empty() {
            input.push_str("\n\n");
        }
        input.push_str(&buf);
    }
    if input.trim().is_empty() {
        return Err(CliError::Usage(
            "no message given; use --user or --stdin".into(),
        ));
    }
    Ok(input)
}

fn build_request(cli: &Cli, input: String) -> Result<GenerateRequest, CliError> {
    let mut request = GenerateRequest::new(input)
        .with_web_search(cli.web_search)
        .with_extended_thinking(cli.thinking)
        .with_max_tokens(cli.max_tokens);
    if let Some(system) = &cli.system {
        request = request.with_instructions(system.clone());
    }
    if let Some(temperature) = cli.temperature {
        request = request.with_temperature(temperature);
    }
    if let Some(path) = &cli.history {
        let text = std::fs::read_to_string(path)
            .map_err(io_error(format!("failed to read {}", path.display())))?;
        let history: Vec<Turn> = serde_json::from_str(&text)
            .map_err(|e| CliError::Usage(format!("invalid history file {}: {e}", path.display())))?;
        request = request.with_history(history);
    }
    if let Some(path) = &cli.attach {
        let attachment = Attachment::from_path(path)
            .map_err(io_error(format!("failed to read {}", path.display())))?;
        request = request.with_attachment(attachment);
    }
    Ok(request)
}

/// Stream the reply to stdout. Returns whether the output is complete.
async fn stream_reply(assistant: &Assistant, request: GenerateRequest) -> Result<bool, CliError> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let stdout = io::stdout();
    let mut sink = FnSink::new(move |chunk: Chunk| {
        let mut out = stdout.lock();
        out.write_all(chunk.render().as_bytes())
            .and_then(|()| out.flush())
            .map_err(|_| SinkClosed)
    });

    let report = assistant.chat_stream(request, &mut sink, &cancel).await?;
    println!();
    match report.state {
        RelayState::Cancelled => {
            eprintln!("  [cancelled after {} chunk(s)]", report.chunks_delivered);
            Ok(false)
        }
        RelayState::FailedAfterOutput => Ok(false),
        _ => Ok(true),
    }
}

async fn run(cli: &Cli) -> Result<bool, CliError> {
    let config = load_config(cli)?;
    let assistant = Assistant::new(HttpBackendFactory::new(config.backend_config()))
        .with_policy(config.retry_policy())
        .with_status_handler(FnStatus::new(|event: &StatusEvent| {
            LoggingStatus.on_status(event);
            if let StatusEvent::Retrying { .. } = event {
                eprintln!("  [{}]", event.describe());
            }
        }));

    let input = read_input(cli)?;

    if let Some(out) = &cli.image {
        let image = assistant
            .generate_image(input, Some(&cli.aspect_ratio))
            .await?;
        std::fs::write(out, &image.data)
            .map_err(io_error(format!("failed to write {}", out.display())))?;
        eprintln!(
            "  Wrote {} ({}, {} bytes)",
            out.display(),
            image.mime_type,
            image.data.len()
        );
        return Ok(true);
    }

    let request = build_request(cli, input)?;

    if cli.json {
        let value = assistant.complete_json(request).await?;
        let pretty = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
        println!("{pretty}");
        return Ok(true);
    }

    if cli.no_stream {
        let text = assistant.complete_text(request).await?;
        println!("{text}");
        return Ok(true);
    }

    stream_reply(&assistant, request).await
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    match run(&cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            if let CliError::Call(classified) = &e {
                tracing::debug!(kind = %classified.kind, "{}", classified.diagnostic);
            }
            process::exit(1);
        }
    }
}
