// Copyright © 2021 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of gnet, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! The per-client composition root.
//!
//! One [`Core`] owns the shared configuration, the host caches, the global
//! search queue and the background scheduler of a client instance. There is
//! deliberately no process-wide state: tests (and odd embedders) run several
//! cores side by side.
//!
//! The embedder's event loop calls [`Core::tick`] once per second; the tick
//! drives cache expiry, the scheduler, global query dispatch, and -- every
//! 63 seconds, rotating through the kinds -- host-cache persistence.

use std::io;

use gnet_sched::Scheduler;
use rand::SeedableRng as _;
use rand_pcg::Pcg64Mcg;

use crate::{
    clock::{Every, Timestamp},
    config::{Config, SharedConfig},
    hcache::{Hcache, HostKind, NetworkView, Paths},
    sq::{PeerMode, SearchIo, Sq},
};

/// Seconds between persistence fires; each fire stores one kind.
const STORE_PERIOD_SECS: u32 = 63;

pub struct Core {
    config: SharedConfig,
    hcache: Hcache<Pcg64Mcg>,
    sched: Scheduler,
    global_sq: Sq,
    peer_mode: PeerMode,
    paths: Option<Paths>,
    store_cadence: Every,
    store_rotation: usize,
}

impl Core {
    pub fn new(config: Config) -> Self {
        Self::with_rng(config, Pcg64Mcg::from_entropy())
    }

    /// Deterministic construction, for tests and simulation.
    pub fn with_rng(config: Config, rng: Pcg64Mcg) -> Self {
        let config = config.shared();
        Self {
            hcache: Hcache::new(config.clone(), rng),
            config,
            sched: Scheduler::new(),
            global_sq: Sq::global(),
            peer_mode: PeerMode::Leaf,
            paths: None,
            store_cadence: Every::new(STORE_PERIOD_SECS),
            store_rotation: 0,
        }
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn hcache(&self) -> &Hcache<Pcg64Mcg> {
        &self.hcache
    }

    pub fn hcache_mut(&mut self) -> &mut Hcache<Pcg64Mcg> {
        &mut self.hcache
    }

    pub fn sched(&self) -> &Scheduler {
        &self.sched
    }

    pub fn sched_mut(&mut self) -> &mut Scheduler {
        &mut self.sched
    }

    pub fn global_sq(&self) -> &Sq {
        &self.global_sq
    }

    pub fn global_sq_mut(&mut self) -> &mut Sq {
        &mut self.global_sq
    }

    pub fn peer_mode(&self) -> PeerMode {
        self.peer_mode
    }

    /// Record a role change. Leaving ultrapeer mode flushes the global
    /// queue: its entries only make sense for the dynamic-query launcher.
    pub fn set_peermode(&mut self, mode: PeerMode) {
        if self.peer_mode == PeerMode::Ultra && mode != PeerMode::Ultra {
            tracing::debug!(backlog = self.global_sq.len(), "leaving ultrapeer mode");
            self.global_sq.clear();
        }
        self.peer_mode = mode;
    }

    /// Persist the host caches under `root` from now on.
    pub fn persist_to(&mut self, root: impl AsRef<std::path::Path>) -> io::Result<()> {
        self.paths = Some(Paths::from_root(root)?);
        Ok(())
    }

    /// Load every kind's host file, if a persistence root is set.
    pub fn restore<N>(&mut self, net: &N, now: Timestamp) -> Result<usize, crate::hcache::store::Error>
    where
        N: NetworkView,
    {
        let paths = match self.paths.as_ref() {
            Some(paths) => paths,
            None => return Ok(0),
        };
        let mut loaded = 0;
        for &kind in HostKind::ALL.iter() {
            loaded += self.hcache.retrieve(net, kind, paths.for_kind(kind), now)?;
        }
        Ok(loaded)
    }

    /// One second of core time.
    pub fn tick<IO>(&mut self, now: Timestamp, io: &mut IO)
    where
        IO: SearchIo,
    {
        self.hcache.expire(now);
        self.sched.sched_timer();
        {
            let cfg = self.config.read();
            self.global_sq.process(now, &cfg, io);
        }
        if self.store_cadence.ready() {
            self.persist_next();
        }
    }

    /// Store the caches and drain everything.
    pub fn shutdown(&mut self) {
        if let Some(paths) = self.paths.as_ref() {
            for &kind in HostKind::ALL.iter() {
                self.hcache.store_if_dirty(kind, paths.for_kind(kind));
            }
        }
        self.global_sq.clear();
        self.hcache.close();
    }

    fn persist_next(&mut self) {
        if let Some(paths) = self.paths.as_ref() {
            let kind = HostKind::ALL[self.store_rotation % HostKind::ALL.len()];
            self.store_rotation += 1;
            self.hcache.store_if_dirty(kind, paths.for_kind(kind));
        }
    }
}
