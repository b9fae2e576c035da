//! SSR Bridge CLI
//!
//! Single-shot mode:
//!   ssr-bridge render <module> [--page <json>]
//!
//! Server mode (persistent process, reads from stdin):
//!   ssr-bridge serve <module>
//!
//! Protocol (server mode):
//!   Request (stdin), one page per line:
//!     {"component":"Users/Index","props":{},"url":"/users"}
//!
//!   Response (stdout):
//!     Status:Ok
//!     Length:1234
//!
//!     {"head":["<title>..."],"body":"<div id=\"app\">..."}
//!
//!   Error response:
//!     Status:Error
//!     Kind:render_threw
//!     Length:42
//!
//!     render threw for component `Users/Index` at /users: ...

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ssr_bridge::{ModuleKind, PagePayload, SsrBridge, SsrConfig, SsrError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

const DEFAULT_PAGE: &str = r#"{"component":"App","props":{},"url":"/"}"#;

#[derive(Parser)]
#[command(name = "ssr-bridge")]
#[command(about = "Render Inertia-style pages with a CommonJS or ES render module", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbosity level (can be repeated)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Render one page and print the result as JSON
    Render {
        #[command(flatten)]
        bridge: BridgeArgs,

        /// Page payload as JSON
        #[arg(long, default_value = DEFAULT_PAGE)]
        page: String,
    },
    /// Render pages read line by line from stdin
    Serve {
        #[command(flatten)]
        bridge: BridgeArgs,
    },
}

#[derive(Args)]
struct BridgeArgs {
    /// Render module to load
    #[arg(value_name = "MODULE", env = "SSR_BRIDGE_MODULE")]
    module: PathBuf,

    /// Module convention (commonjs|module); detected when omitted
    #[arg(long)]
    kind: Option<ModuleKind>,

    /// Sandbox root (defaults to the module's directory)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Render timeout in milliseconds (0 disables)
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,

    /// V8 heap limit in MiB (0 disables)
    #[arg(long, default_value_t = 64)]
    max_heap_mb: usize,

    /// Origin render modules may fetch from (repeatable)
    #[arg(long = "allow-origin", value_name = "ORIGIN")]
    allowed_origins: Vec<String>,
}

impl BridgeArgs {
    fn into_config(self) -> SsrConfig {
        let mut config = SsrConfig::new(self.module)
            .with_timeout((self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms)))
            .with_max_heap_size((self.max_heap_mb > 0).then(|| self.max_heap_mb * 1024 * 1024))
            .with_allowed_origins(self.allowed_origins);
        if let Some(kind) = self.kind {
            config = config.with_module_kind(kind);
        }
        if let Some(root) = self.root {
            config = config.with_root_dir(root);
        }
        config
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // stdout carries rendered output; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_single_shot(bridge: BridgeArgs, page_json: &str) -> Result<()> {
    let page = PagePayload::from_json(page_json).context("Invalid page JSON")?;
    let bridge = SsrBridge::start(bridge.into_config())?;

    let result = bridge.render(page).await?;
    println!("{}", serde_json::to_string(&result)?);

    Ok(())
}

async fn run_server(bridge: BridgeArgs) -> Result<()> {
    let bridge = SsrBridge::start(bridge.into_config())?;

    // Load the module up front so configuration errors show at startup.
    if let Err(e) = bridge.preload().await {
        tracing::error!(code = e.code(), error = %e, "render module failed to preload");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    tracing::info!(module = %bridge.module(), "server ready, reading pages from stdin");

    while let Some(line) = lines.next_line().await? {
        let outcome = match parse_request(&line) {
            None => continue,
            Some(Ok(page)) => bridge.render(page).await,
            Some(Err(e)) => Err(e),
        };

        match outcome {
            Ok(result) => {
                let json = serde_json::to_string(&result)?;
                write_response(&mut stdout, None, &json).await?;
            }
            Err(e) => {
                tracing::warn!(code = e.code(), error = %e, "render failed");
                write_response(&mut stdout, Some(&e), &e.to_string()).await?;
            }
        }
    }

    tracing::info!("stdin closed, shutting down");
    Ok(())
}

/// Parse one stdin line. Blank lines yield `None`.
fn parse_request(line: &str) -> Option<Result<PagePayload, SsrError>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(PagePayload::from_json(line))
}

/// Build one response in the length-prefixed protocol. `Length` counts bytes.
fn frame(error: Option<&SsrError>, body: &str) -> String {
    let mut frame = String::new();
    match error {
        None => frame.push_str("Status:Ok\n"),
        Some(e) => {
            frame.push_str("Status:Error\n");
            frame.push_str(&format!("Kind:{}\n", e.code()));
        }
    }
    frame.push_str(&format!("Length:{}\n\n", body.len()));
    frame.push_str(body);
    frame
}

async fn write_response(
    stdout: &mut tokio::io::Stdout,
    error: Option<&SsrError>,
    body: &str,
) -> Result<()> {
    stdout.write_all(frame(error, body).as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Render { bridge, page } => run_single_shot(bridge, &page).await,
        Command::Serve { bridge } => run_server(bridge).await,
    }
}
