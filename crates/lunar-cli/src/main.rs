use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lunar_config::{DebuggerConfig, LunarConfig};
use lunar_debug::{DebugSession, SessionConfig};
use tokio::net::TcpListener;

mod console;

/// Debug a Lua game over the MobDebug protocol from the terminal.
///
/// After connecting, commands are read line by line from stdin; type `help`
/// for the list.
#[derive(Debug, Parser)]
#[command(name = "lunar", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `LUNAR_CONFIG` is used as a fallback. When neither are
    /// provided the built-in defaults apply.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print values and events as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Connect to a game that is already listening.
    Attach {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Wait for a game to connect, as `require("mobdebug").start()` does.
    Listen {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());
    lunar_config::init_tracing(&config.logging);

    let session = DebugSession::new(session_config(&config.debugger));
    let printer = tokio::spawn(console::print_events(session.subscribe(), cli.json));

    match cli.mode {
        Mode::Attach { host, port } => {
            let host = host.unwrap_or_else(|| config.debugger.host.clone());
            let port = port.unwrap_or(config.debugger.port);
            session
                .attach((host.as_str(), port))
                .await
                .with_context(|| format!("failed to attach to {host}:{port}"))?;
            tracing::info!(%host, port, "attached");
        }
        Mode::Listen { port } => {
            let port = port.unwrap_or(config.debugger.port);
            let listener = TcpListener::bind(("0.0.0.0", port))
                .await
                .with_context(|| format!("failed to listen on port {port}"))?;
            eprintln!("lunar: waiting for a debuggee on port {port}");
            session
                .attach_listener(&listener)
                .await
                .context("debuggee failed to connect")?;
        }
    }

    let result = console::run(&session, cli.json, tokio::io::stdin()).await;
    printer.abort();
    result
}

fn load_config(cli_path: Option<&Path>) -> LunarConfig {
    match LunarConfig::resolve(cli_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("lunar: failed to load config: {err}; continuing with defaults");
            LunarConfig::default()
        }
    }
}

fn session_config(debugger: &DebuggerConfig) -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_millis(debugger.connect_timeout_ms),
        reply_timeout: Duration::from_millis(debugger.reply_timeout_ms),
        max_depth: debugger.max_depth,
        max_body_bytes: debugger.max_body_bytes,
        basedir: debugger.basedir.clone(),
        ..SessionConfig::default()
    }
}
