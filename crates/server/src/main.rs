//! dsync server binary.
//!
//! Runs a session hub over an in-memory store and drives it with
//! newline-delimited JSON on stdin, writing client output to stdout. See
//! [`wire`] for the line format.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dsync_core::{KindRegistry, MemoryStore};
use dsync_hub::{HubConfig, HubHandle, SessionHub};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod driver;
mod wire;

use driver::Driver;

/// Server command line arguments.
#[derive(Parser, Debug)]
#[command(name = "dsync-server")]
#[command(about = "Differential synchronization session hub over stdio")]
struct Args {
	/// Hub configuration file (TOML)
	#[arg(short, long, value_name = "PATH")]
	config: Option<PathBuf>,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	setup_tracing(args.verbose);

	let config = match &args.config {
		Some(path) => HubConfig::load(path)?,
		None => HubConfig::default(),
	};
	info!(?config, "starting dsync-server");

	let kinds = Arc::new(KindRegistry::standard());
	let (hub, inbox) = HubHandle::channel(config.hub_mailbox);
	let store = Arc::new(MemoryStore::new(Arc::clone(&kinds)).with_sink(Arc::new(hub.clone())));
	let hub_task = SessionHub::start(inbox, store.clone(), kinds, config.clone());

	let shutdown = CancellationToken::new();
	let on_signal = shutdown.clone();
	dsync_worker::spawn(dsync_worker::TaskClass::Dispatcher, async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("interrupt received");
			on_signal.cancel();
		}
	});

	let mut driver = Driver::new(hub.clone(), store, config.client_mailbox, tokio::io::stdout());
	driver.serve(BufReader::new(tokio::io::stdin()), shutdown).await?;

	match tokio::time::timeout(config.shutdown_timeout(), hub.shutdown()).await {
		Ok(Ok(())) => {
			hub_task.await?;
			info!("hub drained");
		}
		Ok(Err(err)) => warn!(error = %err, "hub already stopped"),
		Err(_) => warn!(timeout_ms = config.shutdown_timeout_ms, "hub shutdown timed out"),
	}
	driver.finish().await?;

	Ok(())
}

fn setup_tracing(verbose: bool) {
	use std::fs::OpenOptions;

	use tracing_subscriber::EnvFilter;
	use tracing_subscriber::fmt::format::FmtSpan;
	use tracing_subscriber::prelude::*;

	let filter = || {
		EnvFilter::try_from_default_env().unwrap_or_else(|_| {
			if verbose {
				EnvFilter::new("dsync=debug,info")
			} else {
				EnvFilter::new("dsync=info,warn")
			}
		})
	};

	if let Some(log_dir) = std::env::var("DSYNC_LOG_DIR").ok().map(PathBuf::from)
		&& std::fs::create_dir_all(&log_dir).is_ok()
	{
		let log_path = log_dir.join(format!("dsync-server.{}.log", std::process::id()));

		if let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) {
			let file_layer = tracing_subscriber::fmt::layer()
				.with_writer(file)
				.with_ansi(false)
				.with_span_events(FmtSpan::CLOSE)
				.with_target(true);

			tracing_subscriber::registry().with(filter()).with(file_layer).init();

			tracing::info!(path = ?log_path, "tracing initialized");
			return;
		}
	}

	// Stdout carries the protocol, so logs go to stderr.
	tracing_subscriber::fmt().with_env_filter(filter()).with_writer(std::io::stderr).init();
}
