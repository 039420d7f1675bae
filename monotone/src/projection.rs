/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Mapping final accumulators to output records.

use std::collections::BTreeMap;

use serde::Serialize;
use serde::Serializer;
use serde::ser::SerializeMap;

use crate::accum::Accumulator;
use crate::accum::InvariantError;

/// The output record: one per distinct key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub key: String,
    pub monotonic: bool,
}

impl Verdict {
    /// A serializable view that stores the key under `key_field`.
    pub fn record<'a>(&'a self, key_field: &'a str) -> VerdictRecord<'a> {
        VerdictRecord {
            verdict: self,
            key_field,
        }
    }

    /// Serialize as one JSON object with the key stored under
    /// `key_field`, e.g. `{"website":"sitea","monotonic":true}`.
    pub fn to_json_line(&self, key_field: &str) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.record(key_field))
    }
}

/// A [`Verdict`] as written to the output: the key field first, then
/// `monotonic`.
pub struct VerdictRecord<'a> {
    verdict: &'a Verdict,
    key_field: &'a str,
}

impl Serialize for VerdictRecord<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry(self.key_field, &self.verdict.key)?;
        map.serialize_entry("monotonic", &self.verdict.monotonic)?;
        map.end()
    }
}

/// Project one key's final accumulator.
pub fn project<V>(key: &str, acc: &Accumulator<V>) -> Result<Verdict, InvariantError> {
    if acc.is_empty() {
        return Err(InvariantError::EmptyAccumulator {
            key: key.to_string(),
        });
    }
    Ok(Verdict {
        key: key.to_string(),
        monotonic: acc.is_monotonic(),
    })
}

/// Project every key, in key order.
pub fn project_all<V>(
    accumulators: &BTreeMap<String, Accumulator<V>>,
) -> Result<Vec<Verdict>, InvariantError> {
    accumulators
        .iter()
        .map(|(key, acc)| project(key, acc))
        .collect()
}
