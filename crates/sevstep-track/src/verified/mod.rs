//! Pure functions behind the offline event analysis.
//!
//! This module holds the deterministic core of marker segmentation and
//! page arithmetic, kept apart from the [`Event`](crate::events::Event)
//! model, serde and the device client.  Each sub-module contains only
//! functions with **no I/O and no external state mutation**.
//!
//! # Why a separate module?
//!
//! 1. A clear boundary between *checked logic* and *effectful shell*
//!    (log parsing, ioctls).
//! 2. Functions take plain values (`u64` addresses, `Option<u64>` RIPs),
//!    so tests need no fixtures.
//! 3. Tiger Style `debug_assert!` postconditions guard every non-trivial
//!    function.

pub mod paging;
pub mod segmentation;
