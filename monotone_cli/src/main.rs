/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use monotone::Config;
use monotone::JobContext;
use monotone::config::ParseMode;

/// Decide, for each key in a set of newline-delimited JSON observation
/// shards, whether its value never decreases over time.
#[derive(Parser, Debug)]
#[command(name = "monotone")]
struct Cli {
    /// Directory (or single file) of input shards.
    input: Option<PathBuf>,

    /// Directory to create for the results. Must not exist.
    output: Option<PathBuf>,

    /// YAML configuration file. Environment variables and flags take
    /// precedence over it.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of partitions the fold is split across.
    #[arg(long, value_name = "N")]
    partitions: Option<usize>,

    /// Skip malformed records instead of failing.
    #[arg(long)]
    lenient: bool,

    #[arg(long, value_name = "FIELD")]
    timestamp_field: Option<String>,

    #[arg(long, value_name = "FIELD")]
    key_field: Option<String>,

    #[arg(long, value_name = "FIELD")]
    value_field: Option<String>,
}

impl Cli {
    /// The settings given on the command line.
    fn overrides(&self) -> Config {
        Config {
            input_location: self.input.clone(),
            output_location: self.output.clone(),
            parse_mode: self.lenient.then_some(ParseMode::Lenient),
            partitions: self.partitions,
            timestamp_field: self.timestamp_field.clone(),
            key_field: self.key_field.clone(),
            value_field: self.value_field.clone(),
        }
    }

    /// Defaults, then the config file, then `env`, then flags.
    fn layered(&self, env: &Config) -> anyhow::Result<Config> {
        let mut config = Config::new();
        if let Some(path) = &self.config {
            let file = Config::from_yaml(path)
                .with_context(|| format!("loading config file {}", path.display()))?;
            config.merge(&file);
        }
        config.merge(env);
        config.merge(&self.overrides());
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    monotone::telemetry::initialize_logging();
    let result = run(Cli::parse()).await;
    if let Err(err) = &result {
        tracing::error!("monotone failed: {:#}", err);
    }
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli
        .layered(&Config::from_env())?
        .resolve()
        .context("invalid configuration")?;
    tracing::info!(
        "checking {} into {} with {} partitions ({:?} parsing)",
        config.input_location.display(),
        config.output_location.display(),
        config.partitions,
        config.parse_mode
    );

    let summary = JobContext::local(config).run().await?;
    tracing::info!(
        "{} of {} keys monotonic; {} records, {} rejected",
        summary.monotonic_keys,
        summary.keys,
        summary.records,
        summary.rejected
    );
    Ok(())
}
