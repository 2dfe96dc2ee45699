// Copyright © 2021 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of gnet, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Recognized configuration options.
//!
//! The set mirrors the properties a client exposes to its settings layer.
//! Options may change at runtime (`stop_host_get` in particular), so the
//! core shares one handle and reads through it on each operation.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::hcache::CacheType;

pub type SharedConfig = Arc<RwLock<Config>>;

#[derive(Clone, Debug)]
pub struct Config {
    /// Cap for each half of the regular host cache.
    pub max_hosts_cached: usize,
    /// Cap for each half of the ultrapeer host cache.
    pub max_ultra_hosts_cached: usize,
    /// Cap for each of the four behaviour buckets.
    pub max_bad_hosts_cached: usize,
    /// Cap for the GUESS query-key cache.
    pub max_guess_hosts_cached: usize,
    /// Cap for the GUESS introduction cache.
    pub max_guess_intro_hosts_cached: usize,

    /// Minimum seconds between two dispatches from one search queue.
    pub search_queue_spacing: u32,
    /// Maximum number of queries a search queue holds back.
    pub search_queue_size: usize,

    /// Globally disable host admission.
    pub stop_host_get: bool,
    /// Track hosts whose connections keep breaking.
    pub node_monitor_unstable_ip: bool,
    /// Prefer hosts on the local network when picking connection targets.
    pub use_netmasks: bool,
    /// Desired number of ultrapeer connections; the global search queue
    /// holds off until two thirds of these are up.
    pub up_connections: usize,

    /// Verbosity of the host cache (0 = quiet).
    pub hcache_debug: u32,
    /// Verbosity of the GUESS server side (0 = quiet).
    pub guess_server_debug: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_hosts_cached: 1000,
            max_ultra_hosts_cached: 2000,
            max_bad_hosts_cached: 500,
            max_guess_hosts_cached: 500,
            max_guess_intro_hosts_cached: 100,
            search_queue_spacing: 10,
            search_queue_size: 50,
            stop_host_get: false,
            node_monitor_unstable_ip: true,
            use_netmasks: false,
            up_connections: 32,
            hcache_debug: 0,
            guess_server_debug: 0,
        }
    }
}

impl Config {
    pub fn shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    /// The admission cap of a cache type.
    pub fn max_hosts(&self, ty: CacheType) -> usize {
        use CacheType::*;

        match ty {
            FreshAny | ValidAny => self.max_hosts_cached,
            FreshUltra | ValidUltra => self.max_ultra_hosts_cached,
            Timeout | Busy | Unstable | Alien => self.max_bad_hosts_cached,
            Guess => self.max_guess_hosts_cached,
            GuessIntro => self.max_guess_intro_hosts_cached,
        }
    }
}
