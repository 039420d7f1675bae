/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Logging setup.
//!
//! Logs go to stderr through a `tracing_subscriber` fmt layer. The
//! filter is read from [`LOG_ENV_VAR`] using the usual `EnvFilter`
//! directive syntax (e.g. `MONOTONE_LOG=monotone::driver=trace`),
//! falling back to `info`.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the log filter.
pub const LOG_ENV_VAR: &str = "MONOTONE_LOG";

const DEFAULT_DIRECTIVE: &str = "info";
const TEST_DIRECTIVE: &str = "debug";

fn env_filter(default: &str) -> EnvFilter {
    match std::env::var(LOG_ENV_VAR) {
        Ok(directives) if !directives.trim().is_empty() => {
            EnvFilter::try_new(&directives).unwrap_or_else(|err| {
                eprintln!(
                    "ignoring invalid {}={:?}: {}; using `{}`",
                    LOG_ENV_VAR, directives, err, default
                );
                EnvFilter::new(default)
            })
        }
        _ => EnvFilter::new(default),
    }
}

/// Set up process-wide logging to stderr. Calling this more than once
/// is harmless; later calls leave the first subscriber in place.
pub fn initialize_logging() {
    let layer = fmt::Layer::default()
        .with_writer(std::io::stderr)
        .with_target(true);
    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter(DEFAULT_DIRECTIVE))
        .with(layer)
        .try_init()
    {
        tracing::debug!("logging already initialized for this process: {}", err);
    }
}

/// testing
pub fn initialize_logging_for_test() {
    let layer = fmt::Layer::default().with_test_writer();
    let _ = tracing_subscriber::registry()
        .with(env_filter(TEST_DIRECTIVE))
        .with(layer)
        .try_init();
}
