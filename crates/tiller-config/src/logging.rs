// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Logging shape, driven by environment variables:
//!
//! | Variable      | Effect                                              |
//! |---------------|-----------------------------------------------------|
//! | `LOG_LEVEL`   | Base level filter (`error`..`trace`).               |
//! | `DEBUG`       | Shortcut for `LOG_LEVEL=debug`.                     |
//! | `LOG_JSON`    | Emit one JSON object per line instead of text.      |
//! | `LOG_TO_FILE` | Also write to a file under `LOG_DIR`.               |
//! | `LOG_DIR`     | Directory for log files (default `logs/`).          |

use std::path::PathBuf;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Resolved logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub to_file: bool,
    pub dir: PathBuf,
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        let debug = env_flag("DEBUG");
        let level = std::env::var("LOG_LEVEL")
            .ok()
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| if debug { "debug".into() } else { "info".into() });
        Self {
            level,
            json: env_flag("LOG_JSON"),
            to_file: env_flag("LOG_TO_FILE"),
            dir: std::env::var("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("logs")),
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Install the global tracing subscriber.
///
/// Safe to call once per process; later calls are ignored (the first
/// subscriber wins), which keeps tests that each call this from panicking.
pub fn init_logging(cfg: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.level.clone()));

    let file_layer = if cfg.to_file {
        std::fs::create_dir_all(&cfg.dir)?;
        let path = cfg.dir.join("tiller.log");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Some(
            fmt::layer()
                .with_writer(std::sync::Arc::new(file))
                .with_ansi(false),
        )
    } else {
        None
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    let result = if cfg.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    // A second init (e.g. from tests) is not an error worth surfacing.
    let _ = result;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
