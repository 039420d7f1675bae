/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The monotonicity accumulator.
//!
//! An [`Accumulator`] summarizes one contiguous, time-ordered run of a
//! key's observations: its first and last value and whether the run
//! is non-decreasing. That is enough to decide the verdict for the
//! concatenation of two adjacent runs without revisiting either:
//!
//! ```text
//! merge(A, B).monotonic = A.monotonic && B.monotonic && A.last <= B.first
//! ```
//!
//! The merge is an ordered monoid. It is associative when `A`, `B`,
//! `C` are consecutive runs in order, and the empty accumulator is its
//! identity, but it is *not commutative*: `merge(B, A)` describes a
//! different sequence and generally gives a different verdict. Callers
//! must only merge a run with the run that immediately follows it,
//! and must reduce a key's runs as a left-to-right chain. The grouped
//! fold driver is where that is enforced.

use std::cmp::Ordering;
use std::convert::Infallible;

use algebra::Monoid;
use algebra::Semigroup;

use crate::record::AugmentedObservation;
use crate::record::OrderingError;
use crate::record::Value;

/// Violations of the driver's merge discipline or of the projection
/// precondition. These indicate a bug, not bad input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum InvariantError {
    #[error("empty accumulator reached projection for key `{key}`")]
    EmptyAccumulator { key: String },

    #[error("run for key `{key}` from partition {partition} arrived after partition {expected} was expected")]
    OutOfOrderRun {
        key: String,
        partition: usize,
        expected: usize,
    },

    #[error("key `{key}` has two opening runs, from partitions {first} and {second}")]
    DuplicateOpening {
        key: String,
        first: usize,
        second: usize,
    },

    #[error("run for key `{key}` from partition {partition} arrived twice")]
    DuplicateRun { key: String, partition: usize },

    #[error("run for key `{key}` from partition {partition} arrived after the key's last run")]
    RunAfterClose { key: String, partition: usize },

    #[error("key `{key}` has an incomplete run chain: {reason}")]
    IncompleteChain { key: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Bounds<V> {
    first: V,
    last: V,
}

/// Boundary values and verdict of one ordered run.
///
/// An accumulator is either empty (the identity) or covers at least
/// one observation, in which case it has a first and a last value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accumulator<V> {
    bounds: Option<Bounds<V>>,
    is_monotonic: bool,
}

impl<V> Accumulator<V> {
    /// The identity for [`Accumulator::merge_with`].
    pub fn empty() -> Self {
        Self {
            bounds: None,
            is_monotonic: true,
        }
    }

    /// The accumulator of a run with a single observation.
    pub fn lift(value: V) -> Self
    where
        V: Clone,
    {
        Self {
            bounds: Some(Bounds {
                first: value.clone(),
                last: value,
            }),
            is_monotonic: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_none()
    }

    /// Whether the run is non-decreasing. The empty run is.
    pub fn is_monotonic(&self) -> bool {
        self.is_monotonic
    }

    pub fn first_value(&self) -> Option<&V> {
        self.bounds.as_ref().map(|b| &b.first)
    }

    pub fn last_value(&self) -> Option<&V> {
        self.bounds.as_ref().map(|b| &b.last)
    }

    /// Merge `self` with the run that immediately follows it, using
    /// `cmp` to compare the boundary values.
    ///
    /// `cmp` is consulted whenever both sides are non-empty, even if
    /// the verdict is already `false`, so that incomparable values
    /// are reported wherever they meet.
    pub fn merge_with<E>(
        &self,
        next: &Self,
        cmp: impl FnOnce(&V, &V) -> Result<Ordering, E>,
    ) -> Result<Self, E>
    where
        V: Clone,
    {
        let (head, tail) = match (&self.bounds, &next.bounds) {
            (None, _) => return Ok(next.clone()),
            (_, None) => return Ok(self.clone()),
            (Some(head), Some(tail)) => (head, tail),
        };
        let boundary_holds = cmp(&head.last, &tail.first)? != Ordering::Greater;
        Ok(Self {
            bounds: Some(Bounds {
                first: head.first.clone(),
                last: tail.last.clone(),
            }),
            is_monotonic: self.is_monotonic && next.is_monotonic && boundary_holds,
        })
    }

    /// Fold one more observation onto the end of the run, in place.
    /// Equivalent to `self.merge_with(&Accumulator::lift(value), cmp)`.
    pub fn push_with<E>(
        &mut self,
        value: V,
        cmp: impl FnOnce(&V, &V) -> Result<Ordering, E>,
    ) -> Result<(), E>
    where
        V: Clone,
    {
        match &mut self.bounds {
            None => {
                *self = Self::lift(value);
            }
            Some(bounds) => {
                if cmp(&bounds.last, &value)? == Ordering::Greater {
                    self.is_monotonic = false;
                }
                bounds.last = value;
            }
        }
        Ok(())
    }
}

impl<V: Ord + Clone> Accumulator<V> {
    /// Infallible [`Accumulator::push_with`] for totally ordered values.
    pub fn push(&mut self, value: V) {
        match self.push_with(value, |a, b| Ok::<_, Infallible>(a.cmp(b))) {
            Ok(()) => {}
            Err(never) => match never {},
        }
    }
}

impl Accumulator<Value> {
    /// Merge with the following run, failing if the boundary values
    /// are of different kinds.
    pub fn try_merge(&self, next: &Self) -> Result<Self, OrderingError> {
        self.merge_with(next, Value::try_cmp)
    }

    /// Fold the next observation of this run in place. The
    /// observation's own running verdict is carried into the result.
    pub fn try_fold_in(&mut self, observation: AugmentedObservation) -> Result<(), OrderingError> {
        let (_, value, monotonic_so_far) = observation.into_parts();
        self.push_with(value, Value::try_cmp)?;
        self.is_monotonic &= monotonic_so_far;
        Ok(())
    }
}

impl From<AugmentedObservation> for Accumulator<Value> {
    fn from(observation: AugmentedObservation) -> Self {
        let (_, value, monotonic_so_far) = observation.into_parts();
        let mut acc = Self::lift(value);
        acc.is_monotonic = monotonic_so_far;
        acc
    }
}

impl<V> Default for Accumulator<V> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<V: Ord + Clone> Semigroup for Accumulator<V> {
    fn combine(&self, other: &Self) -> Self {
        match self.merge_with(other, |a, b| Ok::<_, Infallible>(a.cmp(b))) {
            Ok(merged) => merged,
            Err(never) => match never {},
        }
    }
}

impl<V: Ord + Clone> Monoid for Accumulator<V> {
    fn empty() -> Self {
        Accumulator::empty()
    }
}
