// Copyright © 2021 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of gnet, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Core runtime machinery of a Gnutella client.
//!
//! Three subsystems make up the core, all driven from a single-threaded
//! event loop with a one-second tick:
//!
//! * [`hcache`] -- a multi-class host cache deciding which peer addresses to
//!   remember, when to promote them between classes, when to expire them,
//!   and how to persist them across runs.
//! * [`sq`] -- per-peer and global search queues pacing outgoing query
//!   messages so the overlay is not flooded.
//! * [`gnet_sched`] (re-exported as [`sched`]) -- a cooperative scheduler
//!   time-slicing long-running work against a wall-clock budget.
//!
//! [`crate::core::Core`] wires the three together for one client instance. The
//! wire protocol, transports and message queues are external collaborators:
//! the cache is fed candidate addresses through [`hcache::Hcache::add`], and
//! the search queues reach the outside world through the [`sq::SearchIo`]
//! seam.

pub use gnet_sched as sched;

pub mod clock;
pub mod config;
pub mod core;
pub mod data;
pub mod hcache;
pub mod host;
pub mod sq;
pub mod stats;

pub use config::Config;
pub use host::Host;
