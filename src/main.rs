//! # vde3d — the reference VDE3 daemon
//!
//! Wires one `hub` engine, one `ctrl` engine, the vde2-compatible datagram
//! transport, and two connection managers (one per engine) into a single
//! `Context`, then runs the Tokio reactor until interrupted.
//!
//! ## Architecture
//!
//! 1. Parse CLI args (module search path, socket directory, verbosity).
//! 2. Configure `tracing` with a colorized stdout layer plus a detailed
//!    rolling-file (or stderr) layer, independently leveled by `-v`.
//! 3. Build and initialize a `Context`, create `hub0`/`ctrl0`/`transport0`,
//!    bind a connection manager over `transport0` for each engine, and
//!    start listening.
//! 4. Block on Ctrl-C, then finalize the context so every component tears
//!    down cleanly.

use std::path::Path;

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod logging;
use logging::ColorizedFormatter;

use vde3::component::ComponentKind;
use vde3::context::Context;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = vde3::cli::Args::parse();

    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_log_layer;
    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = Path::new(path_str);
                let log_dir = log_path.parent().unwrap_or_else(|| Path::new("."));
                let log_filename = log_path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("vde3d.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "vde3d.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry().with(detailed_log_layer).with(stdout_log).init();
    let _log_guard = guard;

    info!("starting vde3d, socket directory {:?}", args.socket_dir);

    let ctx = Context::new();
    ctx.init(&args.module_paths).await?;

    ctx.new_component(ComponentKind::Engine, "hub", "hub0", serde_json::Value::Null).await?;
    ctx.new_component(ComponentKind::ControlEngine, "ctrl", "ctrl0", serde_json::Value::Null).await?;

    // Data plane and control plane each get their own rendezvous directory —
    // one transport per connection manager, since a connection manager
    // installs itself as *the* callback owner of the transport it's bound to.
    let data_dir = args.socket_dir.join("hub");
    let ctrl_dir = args.socket_dir.join("ctrl");
    ctx.new_component(ComponentKind::Transport, "vde2", "transport_hub", json!({ "dir": data_dir })).await?;
    ctx.new_component(ComponentKind::Transport, "vde2", "transport_ctrl", json!({ "dir": ctrl_dir })).await?;

    for (cm_name, transport, engine) in [("cm_hub", "transport_hub", "hub0"), ("cm_ctrl", "transport_ctrl", "ctrl0")] {
        let cm = ctx
            .new_component(
                ComponentKind::ConnectionManager,
                "default",
                cm_name,
                json!({ "transport": transport, "engine": engine }),
            )
            .await?;
        cm.conn_manager_ops().expect("just built as a connection manager").listen(&cm).await?;
    }

    info!("vde3d ready: hub0 on {:?}, ctrl0 on {:?}", data_dir, ctrl_dir);
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    ctx.fini().await;
    Ok(())
}
