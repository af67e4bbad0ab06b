use std::net::IpAddr;

use provisioner_core::{ResponseManager, engine_config, response_rate_limiter};
use provisioner_crypto::ProvisionerKeypair;
use tracing::{error, info};

#[macro_use]
extern crate tracing;

mod setup;

async fn app() -> anyhow::Result<()> {
  let config = engine_config();
  let log_config = logger::LogConfig {
    level: parse_log_level(&config.env.log_level),
    json: config.env.log_json,
    ansi: !config.env.log_json,
  };
  logger::init(&log_config)?;

  info!(
    "Gateway Provisioners engine v{}",
    env!("CARGO_PKG_VERSION")
  );
  info!(
    launch_timeout = config.env.kernel_launch_timeout,
    tunneling = config.env.enable_tunneling,
    impersonation = config.env.impersonation_enabled,
    "resolved engine configuration"
  );

  let keypair = ProvisionerKeypair::generate()?;
  let ip: IpAddr = config.env.response_ip.parse().map_err(|e| {
    anyhow::anyhow!("invalid GP_RESPONSE_IP '{}': {e}", config.env.response_ip)
  })?;
  let response_manager = ResponseManager::bind(
    ip,
    config.env.response_port,
    config.env.response_port_retries,
    keypair,
    response_rate_limiter().clone(),
  )
  .await?;
  info!(
    address = %response_manager.local_addr(),
    "response manager listening"
  );

  let registry = setup::build_registry(config).await;
  let backends = registry.registered_names();
  if backends.is_empty() {
    error!(
      "no backend adapters could be registered; every kernel launch will fail to resolve"
    );
  } else {
    info!(?backends, "ready to accept kernel launches");
  }

  let tunneler = setup::build_tunneler(config);
  info!(
    tunneling_armed = tunneler.is_some(),
    "registry and tunneler ready; each launch builds its own supervisor via setup::build_supervisor"
  );

  tokio::signal::ctrl_c().await?;
  info!("received interrupt, shutting down");
  Ok(())
}

fn parse_log_level(raw: &str) -> logger::LogLevel {
  match raw.to_lowercase().as_str() {
    "trace" => logger::LogLevel::Trace,
    "debug" => logger::LogLevel::Debug,
    "warn" | "warning" => logger::LogLevel::Warn,
    "error" => logger::LogLevel::Error,
    _ => logger::LogLevel::Info,
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();

  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;

  let app = tokio::spawn(app());

  tokio::select! {
    res = app => return res?,
    _ = term_signal.recv() => {
      info!("received SIGTERM, shutting down");
    },
  }

  Ok(())
}
