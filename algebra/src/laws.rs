/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Executable statements of the algebraic laws.
//!
//! The traits in this crate document their laws but cannot enforce
//! them. These predicates let implementors check the laws from unit
//! and property tests.

use crate::Monoid;
use crate::Semigroup;

/// `(a ++ b) ++ c == a ++ (b ++ c)` for `a`, `b`, `c` consecutive in
/// sequence order.
pub fn associative_in_sequence<S>(a: &S, b: &S, c: &S) -> bool
where
    S: Semigroup + PartialEq,
{
    a.combine(b).combine(c) == a.combine(&b.combine(c))
}

/// `empty ++ a == a == a ++ empty`.
pub fn identity<M>(a: &M) -> bool
where
    M: Monoid + PartialEq,
{
    M::empty().combine(a) == *a && a.combine(&M::empty()) == *a
}

/// `a ++ b == b ++ a`. Ordered monoids are expected to fail this for
/// some inputs.
pub fn commutes<S>(a: &S, b: &S) -> bool
where
    S: Semigroup + PartialEq,
{
    a.combine(b) == b.combine(a)
}

/// Splitting `items` at the (sorted, in-bounds) `cuts`, folding each
/// segment, and combining the segment summaries left to right gives
/// the same value as one left fold over `items`.
pub fn segmentation_invariant<M>(items: &[M], cuts: &[usize]) -> bool
where
    M: Monoid + PartialEq + Clone,
{
    let mut segments = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0;
    for &cut in cuts {
        let cut = cut.clamp(start, items.len());
        segments.push(items[start..cut].to_vec());
        start = cut;
    }
    segments.push(items[start..].to_vec());
    M::concat_segments(segments) == M::concat(items.iter().cloned())
}
