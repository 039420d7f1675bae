/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Running the job end to end.
//!
//! A [`JobContext`] is built once per run from a resolved
//! [`JobConfig`] and an [`Engine`] handle, consumed by
//! [`JobContext::run`], and dropped with it. Nothing outlives the run.

use std::sync::Arc;

use crate::accum::InvariantError;
use crate::config::ConfigError;
use crate::config::JobConfig;
use crate::driver;
use crate::driver::DriverError;
use crate::engine::Engine;
use crate::engine::EngineError;
use crate::engine::LocalEngine;
use crate::projection;

/// Errors that abort a run. No output is left behind for any of them.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum JobError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("internal invariant violated: {0}")]
    Invariant(#[from] InvariantError),
}

/// What a successful run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSummary {
    /// Input shards read.
    pub shards: usize,
    /// Observations that entered the fold.
    pub records: usize,
    /// Malformed records skipped in lenient mode.
    pub rejected: usize,
    /// Distinct keys, one output record each.
    pub keys: usize,
    pub monotonic_keys: usize,
    /// Partitions the fold ran with.
    pub partitions: usize,
    /// `part-NNNNN` files written.
    pub output_shards: usize,
}

/// Configuration and engine for one run.
pub struct JobContext {
    config: JobConfig,
    engine: Arc<dyn Engine>,
}

impl JobContext {
    pub fn new(config: JobConfig, engine: Arc<dyn Engine>) -> Self {
        Self { config, engine }
    }

    /// A context over the local filesystem, with one fold partition
    /// per configured partition.
    pub fn local(config: JobConfig) -> Self {
        let engine = Arc::new(LocalEngine::new(config.partitions));
        Self::new(config, engine)
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Read, check and write. The output location is claimed only after
    /// every step has succeeded.
    #[tracing::instrument(
        skip_all,
        fields(
            input = %self.config.input_location.display(),
            output = %self.config.output_location.display(),
        )
    )]
    pub async fn run(self) -> Result<JobSummary, JobError> {
        let Self { config, engine } = self;

        engine.check_output(&config.output_location).await?;

        let shards = engine.load(&config.input_location).await?;
        let shard_count = shards.len();
        tracing::info!("loaded {} shards", shard_count);

        let parsed = engine
            .parse_all(shards, &config.fields, config.parse_mode)
            .await?;
        let rejected = parsed.rejected.len();
        if rejected > 0 {
            tracing::warn!("skipped {} malformed records", rejected);
        }
        let records = parsed.records.len();
        tracing::info!("parsed {} records", records);

        let sorted = engine.sort_by_key_then_order(parsed.records).await?;
        let partitions = engine.parallelism().clamp(1, sorted.len().max(1));
        let accumulators = driver::fold_sorted(sorted, engine.parallelism()).await?;
        tracing::info!("folded {} keys", accumulators.len());

        let verdicts = projection::project_all(&accumulators)?;
        drop(accumulators);
        let keys = verdicts.len();
        let monotonic_keys = verdicts.iter().filter(|v| v.monotonic).count();

        let output_shards = engine
            .write_all(&config.output_location, verdicts, &config.fields)
            .await?;

        let summary = JobSummary {
            shards: shard_count,
            records,
            rejected,
            keys,
            monotonic_keys,
            partitions,
            output_shards,
        };
        tracing::info!(
            keys = summary.keys,
            monotonic = summary.monotonic_keys,
            rejected = summary.rejected,
            "wrote {} result shards",
            summary.output_shards
        );
        Ok(summary)
    }
}

/// Run the job on the local filesystem.
pub async fn run_local(config: JobConfig) -> Result<JobSummary, JobError> {
    JobContext::local(config).run().await
}
