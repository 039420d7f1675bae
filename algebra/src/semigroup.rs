/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Semigroup: associative binary operation over sequence order.

/// A type with a binary operation that is associative *along sequence
/// order*.
///
/// `a.combine(&b)` means "the summary of `a`'s run immediately
/// followed by `b`'s run". Implementations are free to be
/// non-commutative: `a.combine(&b)` and `b.combine(&a)` describe two
/// different sequences and need not agree.
///
/// Laws (not enforced by type system):
///
/// - **Associative**, for `a`, `b`, `c` consecutive in sequence order:
///   `a.combine(b).combine(c) == a.combine(b.combine(c))`
///
/// # Example
///
/// ```rust
/// use algebra::Semigroup;
///
/// // Concatenation is the canonical non-commutative semigroup.
/// #[derive(Clone, Debug, PartialEq, Eq)]
/// struct Trace(String);
///
/// impl Semigroup for Trace {
///     fn combine(&self, other: &Self) -> Self {
///         Trace(format!("{}{}", self.0, other.0))
///     }
/// }
///
/// let a = Trace("a".into());
/// let b = Trace("b".into());
/// let c = Trace("c".into());
/// assert_eq!(a.combine(&b).combine(&c), a.combine(&b.combine(&c)));
/// assert_ne!(a.combine(&b), b.combine(&a));
/// ```
pub trait Semigroup: Sized {
    /// Combine `self` (earlier) with `other` (later).
    fn combine(&self, other: &Self) -> Self;

    /// In-place combine: `self` becomes `self ++ other`.
    fn combine_assign(&mut self, other: &Self) {
        *self = self.combine(other);
    }

    /// Reduce a non-empty sequence strictly left to right. Returns
    /// `None` for an empty iterator.
    fn combine_all<I>(it: I) -> Option<Self>
    where
        I: IntoIterator<Item = Self>,
    {
        it.into_iter().reduce(|acc, x| acc.combine(&x))
    }
}
