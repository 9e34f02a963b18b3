// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Per-packet header caches and the flow-action optimizer.
//!
//! When pipeline logic decides to rewrite fields of a frame in flight
//! it must never touch the decoded packet until the change is
//! confirmed, must recompute the affected protocol checksums, and
//! should not emit a "set field" flow action for a value the flow's
//! match criteria already pin. The [`engine`] module implements that
//! mechanism: one copy-on-write cache per protocol header, a shared
//! commit protocol that reconciles staged changes against the flow's
//! runtime context, and an RFC 1071 checksum engine for the L4
//! protocols that need one.

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[macro_use]
extern crate alloc;

#[cfg(any(feature = "engine", test))]
#[macro_use]
extern crate cfg_if;

#[cfg(any(feature = "engine", test))]
pub mod engine;

pub use swage_api as api;
