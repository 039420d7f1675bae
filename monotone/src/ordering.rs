/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The global order over observations.
//!
//! Observations are ordered by timestamp. Equal timestamps are broken
//! by ingestion position: the shard ordinal (shards are numbered in
//! ascending file-name order) and then the line number within the
//! shard. Both come from the input alone, so the order, and therefore
//! every per-key verdict, is the same for a given input no matter how
//! the job is parallelized.

use std::cmp::Ordering;
use std::fmt;

use crate::record::AugmentedObservation;
use crate::record::Timestamp;

/// Where a record was read: shard ordinal, then 0-based line number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IngestIndex {
    shard: usize,
    line: usize,
}

impl IngestIndex {
    pub fn new(shard: usize, line: usize) -> Self {
        Self { shard, line }
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    pub fn line(&self) -> usize {
        self.line
    }
}

impl fmt::Display for IngestIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard {} line {}", self.shard, self.line + 1)
    }
}

/// Sort rank of one observation within its key. Field order is
/// significant: the derived `Ord` compares `timestamp` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderingKey {
    timestamp: Timestamp,
    ingest: IngestIndex,
}

impl OrderingKey {
    pub fn new(timestamp: Timestamp, ingest: IngestIndex) -> Self {
        Self { timestamp, ingest }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn ingest(&self) -> IngestIndex {
        self.ingest
    }
}

/// The order used for the global sort: key, then [`OrderingKey`].
///
/// Same-key observations end up contiguous and in time order. The
/// relative order of different keys carries no meaning.
pub fn global_cmp(a: &AugmentedObservation, b: &AugmentedObservation) -> Ordering {
    a.key()
        .cmp(b.key())
        .then_with(|| a.order().cmp(b.order()))
}
