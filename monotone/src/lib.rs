/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Per-key monotonicity over sharded, timestamped observations.
//!
//! Given newline-delimited JSON observations `{timestamp, key, value}`
//! spread over any number of input shards, this crate decides for each
//! key whether its values are non-decreasing in time order, and writes
//! one `{key, monotonic}` record per key.
//!
//! The check is an order-dependent fold. It is parallelized by modeling
//! it as an ordered monoid ([`accum::Accumulator`]) and constraining
//! the [`driver`] to merge partial results of one key strictly in
//! sequence order:
//!
//! ```text
//! shards ─ load ─ parse ─ sort(key, time, ingest) ─ partition ─┬─ fold p0 ─┐
//!                                                               ├─ fold p1 ─┼─ ordered merge ─ project ─ write
//!                                                               └─ fold pN ─┘
//! ```
//!
//! [`job::JobContext`] wires these steps together over an
//! [`engine::Engine`].

pub mod accum;
pub mod config;
pub mod driver;
pub mod engine;
pub mod job;
pub mod ordering;
pub mod projection;
pub mod record;
pub mod telemetry;

pub use accum::Accumulator;
pub use config::Config;
pub use config::JobConfig;
pub use job::JobContext;
pub use job::JobError;
pub use job::JobSummary;
pub use projection::Verdict;
pub use record::Observation;
pub use record::Value;
