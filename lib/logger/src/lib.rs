use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
  Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Operator-facing log configuration, loaded once at process start
/// and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
  pub level: LogLevel,
  /// Emit newline-delimited JSON instead of the human-readable
  /// formatter. Operators running under a log aggregator want this;
  /// a developer at a terminal does not.
  pub json: bool,
  pub ansi: bool,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: LogLevel::Info,
      json: false,
      ansi: true,
    }
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
}

impl From<LogLevel> for tracing::Level {
  fn from(level: LogLevel) -> Self {
    match level {
      LogLevel::Trace => tracing::Level::TRACE,
      LogLevel::Debug => tracing::Level::DEBUG,
      LogLevel::Info => tracing::Level::INFO,
      LogLevel::Warn => tracing::Level::WARN,
      LogLevel::Error => tracing::Level::ERROR,
    }
  }
}

pub fn init(config: &LogConfig) -> anyhow::Result<()> {
  let level: tracing::Level = config.level.into();
  let registry =
    Registry::default().with(LevelFilter::from(level));

  match config.json {
    true => registry
      .with(tracing_subscriber::fmt::layer().json())
      .try_init(),
    false => registry
      .with(
        tracing_subscriber::fmt::layer()
          .with_target(true)
          .with_ansi(config.ansi),
      )
      .try_init(),
  }
  .context("failed to init logger")
}
