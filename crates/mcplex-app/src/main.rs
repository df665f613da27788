use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mcplex::config::LogFormat;
use mcplex::{App, Config, RawConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
	name = "mcplex",
	about = "Multiplexing proxy gateway for the Model Context Protocol"
)]
struct Args {
	/// Path to the gateway configuration file (YAML)
	#[arg(short, long, default_value = "config.yaml")]
	config: PathBuf,
	/// Override the listen address from the config file
	#[arg(long)]
	listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	let contents = std::fs::read_to_string(&args.config)
		.with_context(|| format!("failed to read config {}", args.config.display()))?;
	let raw = RawConfig::from_yaml(&contents)?;
	let mut config = Config::from_raw(&raw)?;
	if let Some(listen) = &args.listen {
		config.listen = listen.parse().context("invalid --listen address")?;
	}
	setup_logging(config.log_format);

	let store = raw.build_store()?;
	let config = Arc::new(config);
	let app = App::new(config.clone(), store);
	let cache = app.cache().clone();

	let listener = tokio::net::TcpListener::bind(config.listen)
		.await
		.with_context(|| format!("failed to bind {}", config.listen))?;
	info!("listening on {}", config.listen);
	axum::serve(listener, app.router())
		.with_graceful_shutdown(shutdown_signal())
		.await?;

	// upstream transports own child processes and connections; release them
	// before exit
	cache.close_all().await;
	Ok(())
}

async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
	info!("shutting down");
}

fn setup_logging(format: LogFormat) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	match format {
		LogFormat::Json => tracing_subscriber::fmt()
			.with_env_filter(filter)
			.json()
			.init(),
		LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
	}
}
