//! Interpose - capture HTTP(S) traffic from a launched editor.
//!
//! This is the main binary. It runs:
//! - The default proxy session (MITM capture of the editor's traffic)
//! - The control API (sessions, intercept decisions, event stream)

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use directories::ProjectDirs;
use interpose_app::{AppConfig, AppContext, EditorConfig};
use interpose_core::DEFAULT_BASE_PORT;
use interpose_server::{Server, ServerConfig, DEFAULT_PORT};
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Interpose - intercept and inspect an editor's HTTP(S) traffic
#[derive(Parser, Debug)]
#[command(name = "interpose", version, about)]
struct Args {
    /// First port tried for the proxy
    #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
    port: u16,

    /// Port of the control API
    #[arg(long, default_value_t = DEFAULT_PORT)]
    control_port: u16,

    /// Hold every captured request until it is forwarded or dropped
    #[arg(long)]
    intercept: bool,

    /// Forward held requests automatically after this many seconds
    #[arg(long)]
    hold_timeout_secs: Option<u64>,

    /// Editor to launch behind the proxy
    #[arg(long)]
    editor: Option<PathBuf>,

    /// Extra argument passed to the editor (repeatable)
    #[arg(long = "editor-arg", allow_hyphen_values = true)]
    editor_args: Vec<String>,

    /// Point the OS proxy at the default session while running
    #[arg(long)]
    set_system_proxy: bool,

    /// Directory holding the root CA
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// Print captured events to stdout as JSON lines
    #[arg(long)]
    print_events: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn app_config(&self) -> AppConfig {
        let mut config = AppConfig::default()
            .with_proxy_port(self.port)
            .with_control_port(self.control_port)
            .with_intercept(self.intercept)
            .with_system_proxy(self.set_system_proxy)
            .with_print_events(self.print_events);

        if let Some(secs) = self.hold_timeout_secs {
            config = config.with_hold_timeout(Duration::from_secs(secs));
        }
        if let Some(dir) = &self.ca_dir {
            config = config.with_ca_dir(dir);
        }
        if let Some(program) = &self.editor {
            config = config
                .with_editor(EditorConfig::new(program).with_args(self.editor_args.clone()));
        }
        config
    }
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("dev", "interpose", "Interpose").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    // hudsucker logs every dropped connection; those are reported by our own handler.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("interpose={},hudsucker=off,warn", log_level))
    });

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("interpose")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                // Events go to stdout with --print-events, so logs use stderr.
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Prints every captured event as one JSON line.
fn spawn_event_printer(ctx: &AppContext) {
    let mut rx = ctx.events().subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => match serde_json::to_string(&envelope) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!("Failed to serialize event: {}", e),
                },
                Err(RecvError::Lagged(n)) => tracing::warn!("Event printer skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging (keep guard alive for the duration of the program)
    let _log_guard = init_logging(&args);

    tracing::info!("Starting Interpose...");
    tracing::debug!("Args: {:?}", args);

    let ctx = AppContext::init(args.app_config())?;
    if ctx.config().print_events {
        spawn_event_printer(&ctx);
    }

    let port = ctx.controller().start(ctx.config().proxy_port)?;
    tracing::info!("Proxy listening on 127.0.0.1:{}", port);

    if ctx.config().set_system_proxy {
        let result = ctx.set_system_proxy(port);
        if result.success {
            tracing::info!("{}", result.message);
        } else {
            tracing::warn!("System proxy not set: {}", result.message);
        }
    }

    let server_config = ServerConfig::default().with_port(ctx.config().control_port);
    let server = Server::new(server_config, ctx.server_state())?;

    let served = server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    tracing::info!("Interpose shutting down");
    ctx.shutdown().await;
    served?;
    Ok(())
}
