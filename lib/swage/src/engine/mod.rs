// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The header-cache engine.
//!
//! All code under this namespace is guarded by the `engine` feature
//! flag.
//!
//! An incoming frame is wrapped layer by layer (Ethernet, then IPv4,
//! then the L4 segment) into matching caches. Pipeline logic reads and
//! writes fields through the cache accessors; nothing touches the
//! decoded packets themselves. Each cache's `commit` is invoked once,
//! independently, at the end of the modification phase, handing back
//! whether the wrapped packet actually changed and pruning rewrite
//! actions the flow match already makes redundant.
//!
//! One packet's cache tree lives on one thread for its processing
//! turn; there is no internal locking and every operation is
//! synchronous and CPU-bound. To split a packet into independent
//! output computations, `fork` a cache: the forks share no mutable
//! state and may be committed concurrently, each against its own
//! runtime context.

pub mod cache;
pub mod checksum;
pub mod ether;
pub mod flow;
pub mod icmp;
pub mod ip4;
pub mod l4;
pub mod tcp;
pub mod udp;

cfg_if! {
    if #[cfg(feature = "std")] {
        #[macro_export]
        macro_rules! dbg_macro {
            ($s:tt) => {
                println!($s);
            };
            ($s:tt, $($arg:tt)*) => {
                println!($s, $($arg)*);
            };
        }

        #[macro_export]
        macro_rules! err_macro {
            ($s:tt) => {
                println!(concat!("ERROR: ", $s));
            };
            ($s:tt, $($arg:tt)*) => {
                println!(concat!("ERROR: ", $s), $($arg)*);
            };
        }
    } else {
        #[macro_export]
        macro_rules! dbg_macro {
            ($s:tt) => {};
            ($s:tt, $($arg:tt)*) => {};
        }

        #[macro_export]
        macro_rules! err_macro {
            ($s:tt) => {};
            ($s:tt, $($arg:tt)*) => {};
        }
    }
}

pub use dbg_macro as dbg;
pub use err_macro as err;
