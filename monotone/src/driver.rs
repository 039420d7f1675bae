/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The grouped fold driver.
//!
//! Given the globally sorted stream (key, then ordering key), the
//! driver produces exactly one [`Accumulator`] per key:
//!
//! 1. The stream is cut into contiguous, near-equal [`Partition`]s.
//!    Each partition also records the key of the record just before
//!    and just after it, so that it can tell whether a run it holds
//!    opens or closes its key's sequence.
//! 2. Every partition is folded on its own worker. Each contiguous
//!    same-key run becomes one [`PartialRun`], streamed to the merger
//!    as soon as it is complete. Workers share no state.
//! 3. The [`RunMerger`] receives partial runs in whatever order the
//!    workers produce them. Per key, it buffers runs that arrive early
//!    and merges them strictly in ascending partition order, from the
//!    opening run to the closing run. Runs of one key are only ever
//!    merged with the run that immediately follows them.
//!
//! A key whose observations span partitions `p..=q` therefore has its
//! partials reduced as the chain `((acc_p ++ acc_p+1) ++ ...) ++ acc_q`,
//! which by associativity along sequence order equals a single
//! left-to-right fold over the key's whole sequence.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::btree_map;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::accum::Accumulator;
use crate::accum::InvariantError;
use crate::record::AugmentedObservation;
use crate::record::OrderingError;
use crate::record::Value;

/// The type of error for the grouped fold.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DriverError {
    #[error("values for key `{key}` are not comparable: {source}")]
    Ordering {
        key: String,
        #[source]
        source: OrderingError,
    },

    #[error(transparent)]
    Invariant(#[from] InvariantError),

    #[error("partition worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// A contiguous slice of the globally sorted stream.
#[derive(Debug, Clone)]
pub struct Partition {
    pub index: usize,
    pub records: Vec<AugmentedObservation>,
    /// Key of the record immediately before this partition.
    pub prev_key: Option<String>,
    /// Key of the record immediately after this partition.
    pub next_key: Option<String>,
}

/// The accumulator of one run, tagged with where the run sits in its
/// key's sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialRun {
    pub key: String,
    pub partition: usize,
    /// The key's sequence starts with this run.
    pub opens: bool,
    /// The key's sequence ends with this run.
    pub closes: bool,
    pub acc: Accumulator<Value>,
}

/// Cut a sorted stream into at most `partitions` contiguous slices
/// whose sizes differ by at most one. Empty input yields no
/// partitions.
pub fn partition_sorted(sorted: Vec<AugmentedObservation>, partitions: usize) -> Vec<Partition> {
    let len = sorted.len();
    if len == 0 {
        return Vec::new();
    }
    let count = partitions.clamp(1, len);
    let base = len / count;
    let extra = len % count;

    let mut records = sorted.into_iter();
    let chunks: Vec<Vec<AugmentedObservation>> = (0..count)
        .map(|i| {
            records
                .by_ref()
                .take(base + usize::from(i < extra))
                .collect()
        })
        .collect();

    let first_keys: Vec<Option<String>> = chunks
        .iter()
        .map(|c| c.first().map(|r| r.key().to_string()))
        .collect();
    let last_keys: Vec<Option<String>> = chunks
        .iter()
        .map(|c| c.last().map(|r| r.key().to_string()))
        .collect();

    chunks
        .into_iter()
        .enumerate()
        .map(|(index, records)| Partition {
            index,
            records,
            prev_key: index
                .checked_sub(1)
                .and_then(|prev| last_keys[prev].clone()),
            next_key: first_keys.get(index + 1).cloned().flatten(),
        })
        .collect()
}

/// Fold one partition into its runs, handing each completed run to
/// `emit` in partition order. Returns the number of runs.
pub fn fold_partition(
    partition: Partition,
    mut emit: impl FnMut(PartialRun),
) -> Result<usize, DriverError> {
    let Partition {
        index,
        records,
        prev_key,
        next_key,
    } = partition;

    let mut runs = 0;
    let mut current: Option<(String, Accumulator<Value>)> = None;
    for record in records {
        match &mut current {
            Some((key, acc)) if key.as_str() == record.key() => {
                acc.try_fold_in(record)
                    .map_err(|source| DriverError::Ordering {
                        key: key.clone(),
                        source,
                    })?;
            }
            _ => {
                let key = record.key().to_string();
                let started = (key, Accumulator::from(record));
                if let Some((key, acc)) = current.replace(started) {
                    let opens = runs > 0 || prev_key.as_deref() != Some(key.as_str());
                    emit(PartialRun {
                        key,
                        partition: index,
                        opens,
                        // Another key follows inside this partition.
                        closes: true,
                        acc,
                    });
                    runs += 1;
                }
            }
        }
    }

    if let Some((key, acc)) = current {
        let opens = runs > 0 || prev_key.as_deref() != Some(key.as_str());
        let closes = next_key.as_deref() != Some(key.as_str());
        emit(PartialRun {
            key,
            partition: index,
            opens,
            closes,
            acc,
        });
        runs += 1;
    }
    Ok(runs)
}

/// Per-key merge state: the chain merged so far and runs that arrived
/// ahead of their turn.
#[derive(Default)]
struct Chain {
    /// Partition whose run must be merged next. `None` until the
    /// opening run has arrived.
    next_partition: Option<usize>,
    /// Partition of the opening run.
    opened_at: Option<usize>,
    acc: Accumulator<Value>,
    /// Early runs, keyed by partition.
    buffer: BTreeMap<usize, PartialRun>,
}

/// Merges partial runs into one accumulator per key, in partition
/// order, regardless of arrival order.
#[derive(Default)]
pub struct RunMerger {
    chains: HashMap<String, Chain>,
    finished: BTreeMap<String, Accumulator<Value>>,
}

impl RunMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one partial run. Runs that can be merged now are merged,
    /// along with any buffered successors; others are buffered.
    pub fn accept(&mut self, run: PartialRun) -> Result<(), DriverError> {
        use std::cmp::Ordering;

        if self.finished.contains_key(&run.key) {
            return Err(InvariantError::RunAfterClose {
                key: run.key,
                partition: run.partition,
            }
            .into());
        }

        let chain = self.chains.entry(run.key.clone()).or_default();
        let next_partition = chain.next_partition;
        match next_partition {
            None if run.opens => {
                chain.opened_at = Some(run.partition);
                self.absorb(run)?;
            }
            None => {
                Self::buffer(chain, run)?;
            }
            Some(expected) => {
                if run.opens {
                    return Err(InvariantError::DuplicateOpening {
                        first: chain.opened_at.unwrap_or(expected),
                        second: run.partition,
                        key: run.key,
                    }
                    .into());
                }
                match run.partition.cmp(&expected) {
                    Ordering::Less => {
                        return Err(InvariantError::OutOfOrderRun {
                            key: run.key,
                            partition: run.partition,
                            expected,
                        }
                        .into());
                    }
                    Ordering::Greater => Self::buffer(chain, run)?,
                    Ordering::Equal => self.absorb(run)?,
                }
            }
        }
        Ok(())
    }

    fn buffer(chain: &mut Chain, run: PartialRun) -> Result<(), DriverError> {
        match chain.buffer.entry(run.partition) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(run);
                Ok(())
            }
            btree_map::Entry::Occupied(_) => Err(InvariantError::DuplicateRun {
                key: run.key,
                partition: run.partition,
            }
            .into()),
        }
    }

    // Merge `run`, which is next in its chain, then drain buffered
    // successors until a gap or the closing run.
    fn absorb(&mut self, run: PartialRun) -> Result<(), DriverError> {
        let key = run.key.clone();
        let Some(chain) = self.chains.get_mut(&key) else {
            return Err(InvariantError::IncompleteChain {
                key,
                reason: "chain state missing".to_string(),
            }
            .into());
        };

        let mut run = run;
        loop {
            chain.acc = chain
                .acc
                .try_merge(&run.acc)
                .map_err(|source| DriverError::Ordering {
                    key: key.clone(),
                    source,
                })?;
            let next = run.partition + 1;
            chain.next_partition = Some(next);

            if run.closes {
                if let Some((&partition, _)) = chain.buffer.first_key_value() {
                    return Err(InvariantError::RunAfterClose { key, partition }.into());
                }
                break;
            }
            match chain.buffer.remove(&next) {
                Some(buffered) => {
                    if buffered.opens {
                        return Err(InvariantError::DuplicateOpening {
                            first: chain.opened_at.unwrap_or(next),
                            second: next,
                            key,
                        }
                        .into());
                    }
                    run = buffered;
                }
                None => return Ok(()),
            }
        }

        if let Some(chain) = self.chains.remove(&key) {
            tracing::trace!(
                "key {} complete after partition {:?}",
                key,
                chain.next_partition
            );
            self.finished.insert(key, chain.acc);
        }
        Ok(())
    }

    /// Number of keys whose chain is complete.
    pub fn finished_len(&self) -> usize {
        self.finished.len()
    }

    /// Return the final accumulator of every key. Fails if any chain is
    /// still open.
    pub fn finish(self) -> Result<BTreeMap<String, Accumulator<Value>>, DriverError> {
        let mut open: Vec<(String, Chain)> = self.chains.into_iter().collect();
        open.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some((key, chain)) = open.into_iter().next() {
            let reason = match chain.next_partition {
                None => "opening run never arrived".to_string(),
                Some(expected) => format!("run from partition {} never arrived", expected),
            };
            return Err(InvariantError::IncompleteChain { key, reason }.into());
        }
        Ok(self.finished)
    }
}

/// Fold a globally sorted stream into one accumulator per key, using
/// up to `partitions` parallel workers.
pub async fn fold_sorted(
    sorted: Vec<AugmentedObservation>,
    partitions: usize,
) -> Result<BTreeMap<String, Accumulator<Value>>, DriverError> {
    let parts = partition_sorted(sorted, partitions);
    tracing::debug!("folding {} partitions", parts.len());

    let (tx, mut rx) = mpsc::unbounded_channel::<PartialRun>();
    let mut workers = JoinSet::new();
    for partition in parts {
        let tx = tx.clone();
        workers.spawn_blocking(move || {
            let index = partition.index;
            let len = partition.records.len();
            // A closed receiver means the merge has already failed;
            // the remaining runs are moot.
            let runs = fold_partition(partition, |run| {
                let _ = tx.send(run);
            })?;
            tracing::debug!(
                "partition {} folded {} records into {} runs",
                index,
                len,
                runs
            );
            Ok::<_, DriverError>(runs)
        });
    }
    drop(tx);

    let mut merger = RunMerger::new();
    while let Some(run) = rx.recv().await {
        merger.accept(run)?;
    }
    while let Some(worker) = workers.join_next().await {
        worker??;
    }
    merger.finish()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chrono::Utc;
    use maplit::btreemap;
    use proptest::prelude::*;

    use super::*;
    use crate::ordering::IngestIndex;
    use crate::ordering::global_cmp;
    use crate::record::Observation;

    fn obs(key: &str, millis: i64, value: Value) -> AugmentedObservation {
        AugmentedObservation::ingest(
            Observation::new(Utc.timestamp_millis_opt(millis).unwrap(), key, value),
            IngestIndex::new(0, millis as usize),
        )
    }

    // One observation per value, at successive timestamps, sorted.
    fn sorted(series: &[(&str, &[i64])]) -> Vec<AugmentedObservation> {
        let mut records = Vec::new();
        let mut t = 0;
        for (key, values) in series {
            for v in values.iter() {
                records.push(obs(key, t, Value::Integer(*v)));
                t += 1;
            }
        }
        records.sort_by(global_cmp);
        records
    }

    fn verdicts(accs: &BTreeMap<String, Accumulator<Value>>) -> BTreeMap<String, bool> {
        accs.iter()
            .map(|(k, acc)| (k.clone(), acc.is_monotonic()))
            .collect()
    }

    fn all_runs(parts: Vec<Partition>) -> Vec<PartialRun> {
        let mut runs = Vec::new();
        for part in parts {
            fold_partition(part, |run| runs.push(run)).unwrap();
        }
        runs
    }

    fn lift(v: i64) -> Accumulator<Value> {
        Accumulator::lift(Value::Integer(v))
    }

    fn partial(
        key: &str,
        partition: usize,
        opens: bool,
        closes: bool,
        acc: Accumulator<Value>,
    ) -> PartialRun {
        PartialRun {
            key: key.to_string(),
            partition,
            opens,
            closes,
            acc,
        }
    }

    #[test]
    fn test_partition_sizes_and_boundary_keys() {
        let records = sorted(&[("a", &[1, 2, 3]), ("b", &[4, 5])]);
        let parts = partition_sorted(records, 2);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].records.len(), 3);
        assert_eq!(parts[1].records.len(), 2);
        assert_eq!(parts[0].prev_key, None);
        assert_eq!(parts[0].next_key.as_deref(), Some("b"));
        assert_eq!(parts[1].prev_key.as_deref(), Some("a"));
        assert_eq!(parts[1].next_key, None);
    }

    #[test]
    fn test_partition_never_exceeds_record_count() {
        assert!(partition_sorted(Vec::new(), 4).is_empty());
        let parts = partition_sorted(sorted(&[("a", &[1, 2])]), 8);
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.records.len() == 1));
        assert_eq!(partition_sorted(sorted(&[("a", &[1, 2])]), 0).len(), 1);
    }

    #[test]
    fn test_fold_partition_tags_runs() {
        let records = sorted(&[("a", &[1, 2, 3]), ("b", &[4, 5, 6]), ("c", &[7])]);
        let parts = partition_sorted(records, 3);
        // sizes 3, 2, 2: [a a a] [b b] [b c]
        let runs = all_runs(parts);
        let tags: Vec<(&str, usize, bool, bool)> = runs
            .iter()
            .map(|r| (r.key.as_str(), r.partition, r.opens, r.closes))
            .collect();
        assert_eq!(
            tags,
            vec![
                ("a", 0, true, true),
                ("b", 1, true, false),
                ("b", 2, false, true),
                ("c", 2, true, true),
            ]
        );
    }

    #[test]
    fn test_merger_accepts_any_arrival_order() {
        // Key spans partitions 1..=3; runs arrive last-first.
        let runs = vec![
            partial("k", 3, false, true, lift(9)),
            partial("k", 2, false, false, lift(5)),
            partial("k", 1, true, false, lift(1)),
        ];
        let mut merger = RunMerger::new();
        for run in runs {
            merger.accept(run).unwrap();
        }
        let accs = merger.finish().unwrap();
        let acc = &accs["k"];
        assert!(acc.is_monotonic());
        assert_eq!(acc.first_value(), Some(&Value::Integer(1)));
        assert_eq!(acc.last_value(), Some(&Value::Integer(9)));
    }

    #[test]
    fn test_merger_merges_in_partition_order_not_arrival_order() {
        // In partition order the sequence is 1, 5 (monotonic). Merging
        // in arrival order would compute 5, 1.
        let mut merger = RunMerger::new();
        merger.accept(partial("k", 4, false, true, lift(5))).unwrap();
        assert_eq!(merger.finished_len(), 0);
        merger.accept(partial("k", 3, true, false, lift(1))).unwrap();
        assert_eq!(merger.finished_len(), 1);
        assert!(merger.finish().unwrap()["k"].is_monotonic());
    }

    #[test]
    fn test_merger_rejects_duplicates_and_gaps() {
        let mut merger = RunMerger::new();
        merger.accept(partial("k", 0, true, false, lift(1))).unwrap();
        let err = merger.accept(partial("k", 0, false, false, lift(1))).unwrap_err();
        assert!(matches!(
            err,
            DriverError::Invariant(InvariantError::OutOfOrderRun {
                partition: 0,
                expected: 1,
                ..
            })
        ));

        let mut merger = RunMerger::new();
        merger.accept(partial("k", 0, true, false, lift(1))).unwrap();
        let err = merger.accept(partial("k", 1, true, true, lift(1))).unwrap_err();
        assert!(matches!(
            err,
            DriverError::Invariant(InvariantError::DuplicateOpening { .. })
        ));

        let mut merger = RunMerger::new();
        merger.accept(partial("k", 0, true, true, lift(1))).unwrap();
        let err = merger.accept(partial("k", 1, false, true, lift(2))).unwrap_err();
        assert!(matches!(
            err,
            DriverError::Invariant(InvariantError::RunAfterClose { .. })
        ));

        let mut merger = RunMerger::new();
        merger.accept(partial("k", 0, true, false, lift(1))).unwrap();
        merger.accept(partial("k", 2, false, true, lift(2))).unwrap();
        let err = merger.finish().unwrap_err();
        assert!(
            err.to_string().contains("run from partition 1 never arrived"),
            "{err}"
        );

        let mut merger = RunMerger::new();
        merger.accept(partial("k", 5, false, true, lift(2))).unwrap();
        let err = merger.finish().unwrap_err();
        assert!(err.to_string().contains("opening run never arrived"), "{err}");
    }

    #[test]
    fn test_merger_reports_run_buffered_twice() {
        let mut merger = RunMerger::new();
        merger.accept(partial("k", 0, true, false, lift(1))).unwrap();
        merger.accept(partial("k", 2, false, true, lift(3))).unwrap();
        let err = merger
            .accept(partial("k", 2, false, true, lift(3)))
            .unwrap_err();
        assert!(
            matches!(
                err,
                DriverError::Invariant(InvariantError::DuplicateRun { ref key, partition: 2 })
                    if key == "k"
            ),
            "{err}"
        );
        assert!(err.to_string().contains("arrived twice"), "{err}");
    }

    #[test]
    fn test_merger_reports_incomparable_boundary() {
        let mut merger = RunMerger::new();
        merger.accept(partial("k", 0, true, false, lift(1))).unwrap();
        let err = merger
            .accept(partial(
                "k",
                1,
                false,
                true,
                Accumulator::lift(Value::Text("x".into())),
            ))
            .unwrap_err();
        assert!(matches!(err, DriverError::Ordering { ref key, .. } if key == "k"));
    }

    #[tokio::test]
    async fn test_fold_sorted_scenarios() {
        let records = sorted(&[
            ("siteA", &[10, 13, 13]),
            ("siteB", &[10, 5]),
            ("siteC", &[42]),
        ]);
        for partitions in 1..=9 {
            let accs = fold_sorted(records.clone(), partitions).await.unwrap();
            assert_eq!(
                verdicts(&accs),
                btreemap! {
                    "siteA".to_string() => true,
                    "siteB".to_string() => false,
                    "siteC".to_string() => true,
                },
                "partitions = {partitions}"
            );
        }
    }

    #[tokio::test]
    async fn test_fold_sorted_empty_input() {
        assert!(fold_sorted(Vec::new(), 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fold_sorted_reports_mixed_kinds() {
        let mut records = vec![
            obs("a", 0, Value::Integer(1)),
            obs("a", 1, Value::Text("two".into())),
            obs("b", 2, Value::Integer(1)),
        ];
        records.sort_by(global_cmp);
        for partitions in [1, 2, 3] {
            let err = fold_sorted(records.clone(), partitions).await.unwrap_err();
            assert!(
                matches!(err, DriverError::Ordering { ref key, .. } if key == "a"),
                "partitions = {partitions}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn test_equal_timestamps_follow_ingestion_order() {
        let at = |shard: usize, line: usize, v: i64| {
            AugmentedObservation::ingest(
                Observation::new(Utc.timestamp_millis_opt(0).unwrap(), "k", Value::Integer(v)),
                IngestIndex::new(shard, line),
            )
        };
        // Same instant: shard 0 holds 2, shard 1 holds 1. Ingestion
        // order says 2 then 1, a decrease.
        let mut records = vec![at(1, 0, 1), at(0, 0, 2)];
        records.sort_by(global_cmp);
        let accs = fold_sorted(records, 2).await.unwrap();
        assert!(!accs["k"].is_monotonic());

        let mut records = vec![at(1, 0, 2), at(0, 0, 1)];
        records.sort_by(global_cmp);
        let accs = fold_sorted(records, 2).await.unwrap();
        assert!(accs["k"].is_monotonic());
    }

    fn series() -> impl Strategy<Value = Vec<(String, Vec<i64>)>> {
        prop::collection::vec(
            (
                prop::sample::select(vec!["a", "b", "c", "d"]).prop_map(str::to_string),
                prop::collection::vec(-3i64..3, 1..12),
            ),
            1..5,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64, ..ProptestConfig::default()
        })]
        #[test]
        fn prop_partition_count_does_not_change_verdicts(
            input in series(),
            partitions in 1usize..12,
        ) {
            // Interleave keys in time so each key's values appear in
            // the listed order.
            let mut records = Vec::new();
            let mut expected: BTreeMap<String, Vec<i64>> = BTreeMap::new();
            let mut t = 0;
            let longest = input.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
            for i in 0..longest {
                for (key, values) in &input {
                    if let Some(v) = values.get(i) {
                        records.push(obs(key, t, Value::Integer(*v)));
                        expected.entry(key.clone()).or_default().push(*v);
                        t += 1;
                    }
                }
            }
            records.sort_by(global_cmp);

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .build()
                .unwrap();
            let accs = runtime.block_on(fold_sorted(records, partitions)).unwrap();

            let want: BTreeMap<String, bool> = expected
                .into_iter()
                .map(|(k, vs)| (k, vs.windows(2).all(|w| w[0] <= w[1])))
                .collect();
            prop_assert_eq!(verdicts(&accs), want);
        }

        #[test]
        fn prop_shuffled_arrival_gives_same_result(
            values in prop::collection::vec(-3i64..3, 1..30),
            partitions in 1usize..10,
            seed in any::<u64>(),
        ) {
            let records = sorted(&[("k", values.as_slice())]);
            let mut runs = all_runs(partition_sorted(records, partitions));
            // Deterministic shuffle from the seed.
            let mut state = seed | 1;
            for i in (1..runs.len()).rev() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                runs.swap(i, (state % (i as u64 + 1)) as usize);
            }
            let mut merger = RunMerger::new();
            for run in runs {
                merger.accept(run).unwrap();
            }
            let accs = merger.finish().unwrap();
            prop_assert_eq!(
                accs["k"].is_monotonic(),
                values.windows(2).all(|w| w[0] <= w[1])
            );
        }
    }
}
