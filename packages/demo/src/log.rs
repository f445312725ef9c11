//! Logger setup, trimmed from the engine's own reference binary: structured
//! `tracing` output to stderr, filterable via `ERECT_LOG`.

use clap::ValueEnum;
use tracing_subscriber::{Layer as _, layer::SubscriberExt as _};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum WhenColor {
    Always,
    Never,
    Auto,
}

pub fn make_logger(color: WhenColor) -> impl tracing::Subscriber {
    tracing_subscriber::registry()
        .with(tracing_error::ErrorLayer::default())
        .with({
            let layer = tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(true)
                .with_thread_ids(true);
            match color {
                WhenColor::Always => layer.with_ansi(true),
                WhenColor::Never => layer.with_ansi(false),
                WhenColor::Auto => layer,
            }
            .with_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_env_var("ERECT_LOG")
                    .from_env_lossy(),
            )
        })
}
