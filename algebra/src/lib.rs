/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![deny(missing_docs)]

//! Algebraic structures for order-sensitive accumulation.
//!
//! This crate provides the traits used to express reductions whose
//! combine step depends on the order of its inputs, so that such
//! reductions can be split across independent workers and still be
//! recombined correctly.
//!
//! # Quick Start
//!
//! ```rust
//! use algebra::Monoid;
//! use algebra::Semigroup;
//!
//! #[derive(Clone, Debug, PartialEq, Eq)]
//! struct Trace(Vec<u8>);
//!
//! impl Semigroup for Trace {
//!     fn combine(&self, other: &Self) -> Self {
//!         let mut out = self.0.clone();
//!         out.extend_from_slice(&other.0);
//!         Trace(out)
//!     }
//! }
//!
//! impl Monoid for Trace {
//!     fn empty() -> Self {
//!         Trace(Vec::new())
//!     }
//! }
//!
//! let whole = Trace::concat(vec![Trace(vec![1]), Trace(vec![2]), Trace(vec![3])]);
//! let split = Trace::concat_segments(vec![
//!     vec![Trace(vec![1])],
//!     vec![Trace(vec![2]), Trace(vec![3])],
//! ]);
//! assert_eq!(whole, split);
//! ```
//!
//! # Core Concepts
//!
//! - **Semigroup**: a type with a binary operation (`combine`) that is
//!   associative *along sequence order*: for three consecutive pieces
//!   of a sequence, grouping does not matter, but the pieces must stay
//!   in order.
//!
//! - **Monoid**: a semigroup with an identity element (`empty`).
//!
//! - **CommutativeMonoid**: a monoid where combine is also
//!   commutative. Only these may be reduced in arbitrary pairing
//!   order.
//!
//! # Why Order Matters for Partitioned Reduction
//!
//! A generic parallel reduce is free to pair partial results in any
//! order. That is only sound for commutative monoids. For an ordered
//! monoid, a partitioned reduction must:
//!
//! ```text
//! 1. split the sequence into contiguous segments,
//! 2. fold each segment left to right (anywhere, in parallel),
//! 3. combine the segment summaries as a linear chain, in segment order.
//! ```
//!
//! [`Monoid::concat_segments`] is the reference statement of this
//! shape, and [`laws::segmentation_invariant`] checks it.

mod monoid;
mod semigroup;

pub mod laws;

pub use monoid::CommutativeMonoid;
pub use monoid::Monoid;
pub use semigroup::Semigroup;
