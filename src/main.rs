//! SSR bundle renderer CLI
//!
//! Single-shot mode:
//!   ssr-bundle-renderer <bundle> [context-json]
//!
//! Server mode (persistent process, reads from stdin):
//!   ssr-bundle-renderer --server <bundle>
//!
//! Protocol (server mode):
//!   Request (stdin), one line per render:
//!     {"url":"/home","user":"Alice"}
//!
//!   Response (stdout):
//!     Status:Ok
//!     Length:1234
//!
//!     <!DOCTYPE html>...
//!
//!   Error response:
//!     Status:Error
//!     Length:42
//!
//!     TypeError: Cannot read properties of undefined...

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use futures::StreamExt;
use ssr_bundle_renderer::{
    BundleRenderer, ClientManifest, ContextReuseMode, RenderContext, RendererOptions,
    SandboxConfig,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(version, about = "Render server bundles into HTML inside a sandboxed runtime", long_about = None)]
struct Cli {
    /// Server bundle: a `.json` bundle or a self-contained `.js` module
    bundle: PathBuf,

    /// Render context as JSON (single-shot mode)
    context: Option<String>,

    /// Keep the runtime alive and serve renders over stdin/stdout
    #[arg(long)]
    server: bool,

    /// HTML shell the rendered markup is placed into
    #[arg(long)]
    template: Option<PathBuf>,

    /// Client build manifest used for resource hints and scripts
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Execution context reuse: fresh, shared-once or shared-global
    #[arg(long, default_value_t = ContextReuseMode::Fresh)]
    mode: ContextReuseMode,

    /// Directory external packages are resolved from
    #[arg(long)]
    basedir: Option<PathBuf>,

    /// Production mode for bundle code and the emitted state script
    #[arg(long)]
    production: bool,

    /// Leave injection of hints, styles, state and scripts to the template
    #[arg(long)]
    no_inject: bool,

    /// Write chunks as they are rendered (single-shot mode)
    #[arg(long)]
    stream: bool,

    /// Heap limit of the sandbox in MiB, 0 for unlimited
    #[arg(long, default_value_t = 64)]
    max_heap_mb: usize,

    /// Abort a render after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logger(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn build_options(cli: &Cli) -> Result<RendererOptions> {
    let template = cli.template.as_deref().map(read_file).transpose()?;
    let client_manifest = cli
        .manifest
        .as_deref()
        .map(ClientManifest::from_file)
        .transpose()?;

    Ok(RendererOptions {
        inject: !cli.no_inject,
        template: template.map(Into::into),
        client_manifest,
        basedir: cli.basedir.clone(),
        context_reuse_mode: cli.mode,
        production: cli.production,
        sandbox: SandboxConfig {
            max_heap_size: (cli.max_heap_mb > 0).then(|| cli.max_heap_mb * 1024 * 1024),
            timeout_ms: cli.timeout_ms,
        },
        ..Default::default()
    })
}

fn parse_context(json: &str) -> Result<RenderContext> {
    if json.trim().is_empty() {
        return Ok(RenderContext::new());
    }
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| anyhow!("Invalid context JSON: {}", e))?;
    RenderContext::from_value(value).map_err(|e| anyhow!("Invalid context: {}", e))
}

/// Print captured console output to stderr
async fn flush_console(renderer: &BundleRenderer) {
    let console = renderer.console().await;
    for log in &console.logs {
        eprintln!("[LOG] {}", log);
    }
    for warn in &console.warns {
        eprintln!("[WARN] {}", warn);
    }
    for err in &console.errors {
        eprintln!("[ERROR] {}", err);
    }
}

/// Render once and print the document to stdout
async fn run_single_shot(renderer: &BundleRenderer, context_json: Option<&str>, stream: bool) -> Result<()> {
    let mut context = parse_context(context_json.unwrap_or_default())?;
    let mut stdout = std::io::stdout();

    if stream {
        let mut chunks = renderer.render_to_stream(context);
        let mut failure = None;
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) => {
                    stdout.write_all(chunk.as_bytes())?;
                    stdout.flush()?;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        flush_console(renderer).await;
        if let Some(e) = failure {
            return Err(report(e));
        }
        writeln!(stdout)?;
        return Ok(());
    }

    let result = renderer.render_to_string(&mut context).await;
    flush_console(renderer).await;
    let html = result.map_err(report)?;
    println!("{}", html);
    Ok(())
}

fn report(error: ssr_bundle_renderer::RenderError) -> anyhow::Error {
    match error.stack() {
        Some(stack) => anyhow!("{}", stack),
        None => anyhow!(error),
    }
}

/// Serve renders from stdin until it closes. The runtime and its compiled
/// modules persist across requests.
async fn run_server(renderer: &BundleRenderer) -> Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut reader = stdin.lock();

    tracing::info!("server ready, reading from stdin");

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            // EOF - stdin closed, exit gracefully
            break;
        }

        let mut context = match parse_context(&line) {
            Ok(context) => context,
            Err(e) => {
                write_response(&mut stdout, false, &e.to_string())?;
                continue;
            }
        };

        let result = renderer.render_to_string(&mut context).await;
        flush_console(renderer).await;
        match result {
            Ok(html) => write_response(&mut stdout, true, &html)?,
            Err(e) => {
                tracing::debug!("render failed: {}", e);
                let body = e.stack().map(str::to_string).unwrap_or_else(|| e.to_string());
                write_response(&mut stdout, false, &body)?;
            }
        }
    }

    tracing::info!("server shutting down");
    Ok(())
}

/// Write response in length-prefixed protocol
fn write_response(stdout: &mut std::io::Stdout, ok: bool, body: &str) -> Result<()> {
    let status = if ok { "Ok" } else { "Error" };

    writeln!(stdout, "Status:{}", status)?;
    writeln!(stdout, "Length:{}", body.len())?;
    writeln!(stdout)?; // Empty line separator
    write!(stdout, "{}", body)?;
    stdout.flush()?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let bundle = std::path::absolute(&cli.bundle)
        .with_context(|| format!("Invalid bundle path {}", cli.bundle.display()))?;
    let options = build_options(&cli)?;
    let renderer = BundleRenderer::new(bundle, options)?;
    tracing::debug!("loaded bundle {} ({} mode)", cli.bundle.display(), cli.mode);

    if cli.server {
        run_server(&renderer).await
    } else {
        run_single_shot(&renderer, cli.context.as_deref(), cli.stream).await
    }
}
