// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Shared vocabulary for the swage header-cache engine.
//!
//! This crate holds the value types exchanged between the engine and
//! its consumers: link/internet addresses, IP protocol numbers, and
//! the flow-model identifiers (match fields, rewrite-action kinds, and
//! the simplified flow match record the caches populate).

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(any(feature = "std", test))]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

pub mod flow;
pub mod ip;
pub mod mac;

pub use flow::*;
pub use ip::*;
pub use mac::*;

/// The overall version of the API. Anytime a type in this crate is
/// added, removed, or modified, this number should increment. We
/// attach no semantic meaning to the number other than as a means to
/// verify that two components are compiled against the same API.
pub const API_VERSION: u64 = 3;
