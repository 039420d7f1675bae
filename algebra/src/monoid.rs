/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Monoid: ordered semigroup with identity element.

use super::Semigroup;

/// A semigroup with an identity element.
///
/// Laws:
/// - Identity: `empty().combine(a) == a` and `a.combine(empty()) == a`
/// - Associativity along sequence order: inherited from [`Semigroup`]
///
/// Commutativity is *not* implied. Folding helpers on this trait
/// always combine strictly left to right, so they are correct for
/// order-sensitive monoids.
pub trait Monoid: Semigroup {
    /// The identity element.
    fn empty() -> Self;

    /// Fold a sequence left to right, starting from [`Monoid::empty`].
    fn concat<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Self>,
    {
        iter.into_iter()
            .fold(Self::empty(), |acc, x| acc.combine(&x))
    }

    /// Fold each contiguous segment independently, then combine the
    /// segment summaries in segment order.
    ///
    /// For a lawful monoid this equals [`Monoid::concat`] over the
    /// flattened sequence, for any segmentation. This is the shape of
    /// a partitioned reduction: segments may be folded anywhere, but
    /// their summaries must be combined as a linear chain.
    ///
    /// ```rust
    /// use algebra::Monoid;
    /// use algebra::Semigroup;
    ///
    /// #[derive(Clone, Debug, PartialEq, Eq)]
    /// struct Trace(String);
    ///
    /// impl Semigroup for Trace {
    ///     fn combine(&self, other: &Self) -> Self {
    ///         Trace(format!("{}{}", self.0, other.0))
    ///     }
    /// }
    ///
    /// impl Monoid for Trace {
    ///     fn empty() -> Self {
    ///         Trace(String::new())
    ///     }
    /// }
    ///
    /// let t = |s: &str| Trace(s.to_string());
    /// let segmented = Trace::concat_segments(vec![vec![t("a"), t("b")], vec![t("c")]]);
    /// assert_eq!(segmented, Trace::concat(vec![t("a"), t("b"), t("c")]));
    /// ```
    fn concat_segments<S, I>(segments: S) -> Self
    where
        S: IntoIterator<Item = I>,
        I: IntoIterator<Item = Self>,
    {
        Self::concat(segments.into_iter().map(Self::concat))
    }
}

/// A monoid whose combine is also commutative.
///
/// Additional law:
/// - Commutativity: `a.combine(b) == b.combine(a)`
///
/// Only types with this marker may be reduced in arbitrary pairing
/// order (for example by an unordered reduce-by-key).
pub trait CommutativeMonoid: Monoid {}
