// Copyright © 2021 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of gnet, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! The multi-class host cache.
//!
//! Candidate peers arrive from the protocol layer and are sorted into ten
//! buckets: fresh/valid regular peers, fresh/valid ultrapeers, four
//! behaviour buckets for hosts we would rather avoid, and two GUESS pools.
//! Admission is gated (own address, connected peers, unroutable, bogus or
//! hostile addresses) and probabilistically thinned as a bucket fills;
//! duplicates can promote a host between classes. Extraction is LIFO, the
//! freshest host first, with the valid half spliced in when the fresh half
//! drains.
//!
//! A host is in at most one cache of a class at any time; the per-class
//! tables carry its metadata and are the source of truth for membership.

use std::net::IpAddr;

use itertools::Itertools as _;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    clock::Timestamp,
    config::SharedConfig,
    host::{self, Host},
    stats::{AdmissionDrops, CacheStats, Catcher, Populations},
};

mod cache;
use cache::Cache;

pub mod store;
pub use store::Paths;

/// Behaviour buckets expire, and stale on-disk entries clamp, at 30 minutes.
const EXPIRY_SECS: i64 = 30 * 60;

/// Below this population a kind is considered low on hosts.
const MIN_RESERVE: usize = 1024;

/// The ten cache buckets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheType {
    FreshAny = 0,
    ValidAny,
    FreshUltra,
    ValidUltra,
    Timeout,
    Busy,
    Unstable,
    Alien,
    Guess,
    GuessIntro,
}

/// A host belongs to at most one cache per class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheClass {
    Host,
    Guess,
}

/// The externally meaningful grouping of buckets: regular peers, ultrapeers
/// and GUESS hosts, each a fresh/valid pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostKind {
    Any,
    Ultra,
    Guess,
}

impl CacheType {
    pub const ALL: [CacheType; 10] = [
        CacheType::FreshAny,
        CacheType::ValidAny,
        CacheType::FreshUltra,
        CacheType::ValidUltra,
        CacheType::Timeout,
        CacheType::Busy,
        CacheType::Unstable,
        CacheType::Alien,
        CacheType::Guess,
        CacheType::GuessIntro,
    ];

    pub fn class(self) -> CacheClass {
        match self {
            CacheType::Guess | CacheType::GuessIntro => CacheClass::Guess,
            _ => CacheClass::Host,
        }
    }

    /// The four caches of well-behaved, connectable peers.
    pub fn is_good(self) -> bool {
        matches!(
            self,
            CacheType::FreshAny | CacheType::ValidAny | CacheType::FreshUltra | CacheType::ValidUltra
        )
    }

    pub fn is_bad(self) -> bool {
        matches!(
            self,
            CacheType::Timeout | CacheType::Busy | CacheType::Unstable | CacheType::Alien
        )
    }

    /// Behaviour buckets are keyed by address alone (canonical port 0).
    pub fn addr_only(self) -> bool {
        matches!(self, CacheType::Timeout | CacheType::Busy | CacheType::Unstable)
    }

    /// The other half of a fresh/valid pair, for the good caches.
    fn sibling(self) -> Option<CacheType> {
        match self {
            CacheType::FreshAny => Some(CacheType::ValidAny),
            CacheType::ValidAny => Some(CacheType::FreshAny),
            CacheType::FreshUltra => Some(CacheType::ValidUltra),
            CacheType::ValidUltra => Some(CacheType::FreshUltra),
            _ => None,
        }
    }

    pub fn catcher(self) -> Catcher {
        match self {
            CacheType::FreshAny | CacheType::ValidAny => Catcher::Any,
            CacheType::FreshUltra | CacheType::ValidUltra => Catcher::Ultra,
            CacheType::Timeout | CacheType::Busy | CacheType::Unstable | CacheType::Alien => {
                Catcher::Bad
            },
            CacheType::Guess => Catcher::Guess,
            CacheType::GuessIntro => Catcher::GuessIntro,
        }
    }

    fn label(self) -> &'static str {
        match self {
            CacheType::FreshAny => "fresh.any",
            CacheType::ValidAny => "valid.any",
            CacheType::FreshUltra => "fresh.ultra",
            CacheType::ValidUltra => "valid.ultra",
            CacheType::Timeout => "timeout",
            CacheType::Busy => "busy",
            CacheType::Unstable => "unstable",
            CacheType::Alien => "alien",
            CacheType::Guess => "guess",
            CacheType::GuessIntro => "guess.intro",
        }
    }
}

impl std::fmt::Display for CacheType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl HostKind {
    /// Kinds in persistence-rotation order.
    pub const ALL: [HostKind; 3] = [HostKind::Any, HostKind::Ultra, HostKind::Guess];

    /// The half drained preferentially.
    pub fn fresh(self) -> CacheType {
        match self {
            HostKind::Any => CacheType::FreshAny,
            HostKind::Ultra => CacheType::FreshUltra,
            HostKind::Guess => CacheType::Guess,
        }
    }

    /// The half spliced in when the fresh half empties.
    pub fn valid(self) -> CacheType {
        match self {
            HostKind::Any => CacheType::ValidAny,
            HostKind::Ultra => CacheType::ValidUltra,
            HostKind::Guess => CacheType::GuessIntro,
        }
    }
}

/// Host metadata, one entry per host per class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostEntry {
    pub cache: CacheType,
    pub added: Timestamp,
}

/// A candidate host that survived the admission gates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Caught {
    pub cache: CacheType,
    pub host: Host,
}

/// What the cache needs to know about the rest of the world.
///
/// The blanket defaults are permissive; `()` is the null view. Plain
/// routability is a property of the address itself ([`host::is_routable`])
/// and not part of this seam.
pub trait NetworkView {
    /// The advertised public address of this node, if known.
    fn local_host(&self) -> Option<Host> {
        None
    }

    /// Is there a live connection to `host`?
    fn is_connected(&self, _host: &Host) -> bool {
        false
    }

    /// Is `addr` inside a range known to be unallocated?
    fn is_bogus(&self, _addr: &IpAddr) -> bool {
        false
    }

    /// Is `addr` on the hostile list?
    fn is_hostile(&self, _addr: &IpAddr) -> bool {
        false
    }

    /// Is `addr` within one of the configured local netmasks?
    fn is_nearby(&self, _addr: &IpAddr) -> bool {
        false
    }
}

impl NetworkView for () {}

/// The host cache of one client instance.
pub struct Hcache<R> {
    caches: Vec<Cache>,
    hosts: FxHashMap<Host, HostEntry>,
    guess: FxHashMap<Host, HostEntry>,
    rng: R,
    config: SharedConfig,
    drops: AdmissionDrops,
    populations: Populations,
    subscribers: Vec<Box<dyn Fn(&Caught)>>,
    low_on_pongs: bool,
    closing: bool,
}

impl<R> Hcache<R>
where
    R: rand::Rng,
{
    pub fn new(config: SharedConfig, rng: R) -> Self {
        let mut this = Self {
            caches: CacheType::ALL.iter().map(|ty| Cache::new(*ty)).collect(),
            hosts: FxHashMap::default(),
            guess: FxHashMap::default(),
            rng,
            config,
            drops: AdmissionDrops::default(),
            populations: Populations::default(),
            subscribers: Vec::new(),
            low_on_pongs: true,
            closing: false,
        };
        this.recompute_low_on_pongs();
        this
    }

    /// Subscribe to admissions that survive the gates. Fired before the
    /// slot filter, so a notification does not imply the host was stored.
    pub fn on_caught<F>(&mut self, subscriber: F)
    where
        F: Fn(&Caught) + 'static,
    {
        self.subscribers.push(Box::new(subscriber));
    }

    /// Register a candidate host.
    ///
    /// The return value means "the pair passed the sanity checks", not that
    /// a slot was taken: duplicates and filtered admissions return `true`.
    #[tracing::instrument(level = "trace", skip(self, net))]
    pub fn add<N>(&mut self, net: &N, ty: CacheType, host: Host, now: Timestamp, label: &str) -> bool
    where
        N: NetworkView,
    {
        self.add_at(net, ty, host, now, now, label)
    }

    /// Register a freshly learned host of `kind`.
    pub fn add_caught<N>(
        &mut self,
        net: &N,
        kind: HostKind,
        host: Host,
        now: Timestamp,
        label: &str,
    ) -> bool
    where
        N: NetworkView,
    {
        self.add(net, kind.fresh(), host, now, label)
    }

    /// Register a host of `kind` we have successfully talked to.
    pub fn add_valid<N>(
        &mut self,
        net: &N,
        kind: HostKind,
        host: Host,
        now: Timestamp,
        label: &str,
    ) -> bool
    where
        N: NetworkView,
    {
        self.add(net, kind.valid(), host, now, label)
    }

    /// Drop `host` if it sits in one of the four good caches.
    pub fn purge(&mut self, host: Host) {
        if let Some(entry) = self.hosts.get(&host).copied() {
            if entry.cache.is_good() {
                self.caches[entry.cache as usize].list.remove(&host);
                self.discard(entry.cache, host);
            }
        }
    }

    /// Empty one bucket under mass-update semantics.
    pub fn clear(&mut self, ty: CacheType) {
        self.start_mass_update(ty);
        while let Some(host) = self.caches[ty as usize].list.pop_back() {
            self.discard(ty, host);
        }
        self.stop_mass_update(ty);
    }

    /// Empty both halves of a kind.
    pub fn clear_kind(&mut self, kind: HostKind) {
        self.clear(kind.fresh());
        self.clear(kind.valid());
    }

    /// Extract the freshest host of `kind` for an outbound connection.
    ///
    /// Consults the local network first when netmasks are in use; splices
    /// the valid half in when the fresh half is empty, so something is
    /// found whenever the union is non-empty.
    pub fn get_caught<N>(&mut self, net: &N, kind: HostKind) -> Option<Host>
    where
        N: NetworkView,
    {
        if self.config.read().use_netmasks {
            if let Some(host) = self.find_nearby(net, kind) {
                return Some(host);
            }
        }
        self.require_fresh(kind);
        let fresh = kind.fresh();
        let host = self.caches[fresh as usize].list.pop_front()?;
        self.discard(fresh, host);
        Some(host)
    }

    /// Copy up to `n` hosts of `kind` without removing them, deduplicated
    /// within the result, freshest first.
    pub fn fill_caught_array(&self, kind: HostKind, n: usize) -> Vec<Host> {
        let mut seen = FxHashSet::default();
        let mut out = Vec::new();
        for &ty in &[kind.fresh(), kind.valid()] {
            for host in self.caches[ty as usize].list.iter() {
                if out.len() >= n {
                    return out;
                }
                if seen.insert(*host) {
                    out.push(*host);
                }
            }
        }
        out
    }

    /// Extract the first host of `kind` on the local network, if any.
    pub fn find_nearby<N>(&mut self, net: &N, kind: HostKind) -> Option<Host>
    where
        N: NetworkView,
    {
        for &ty in &[kind.fresh(), kind.valid()] {
            let found = self.caches[ty as usize]
                .list
                .iter()
                .find(|h| net.is_nearby(&h.addr()))
                .copied();
            if let Some(host) = found {
                self.caches[ty as usize].list.remove(&host);
                self.discard(ty, host);
                return Some(host);
            }
        }
        None
    }

    /// Hosts of `kind` across both halves.
    pub fn size(&self, kind: HostKind) -> usize {
        self.caches[kind.fresh() as usize].list.len()
            + self.caches[kind.valid() as usize].list.len()
    }

    pub fn is_low(&self, kind: HostKind) -> bool {
        self.size(kind) < MIN_RESERVE
    }

    /// Has `addr` earned a place in one of the behaviour buckets?
    pub fn node_is_bad(&self, addr: IpAddr) -> bool {
        self.hosts.get(&Host::new(addr, 0)).map_or(false, |entry| {
            matches!(
                entry.cache,
                CacheType::Timeout | CacheType::Busy | CacheType::Unstable
            )
        })
    }

    /// Walk the behaviour buckets' tails and drop entries older than 30
    /// minutes. Driven once per second.
    pub fn expire(&mut self, now: Timestamp) {
        for &ty in &[CacheType::Timeout, CacheType::Busy, CacheType::Unstable] {
            loop {
                let stale = match self.caches[ty as usize].list.back().copied() {
                    Some(host) => {
                        let added = self.hosts.get(&host).map(|e| e.added).unwrap_or(now);
                        if now - added > EXPIRY_SECS {
                            Some(host)
                        } else {
                            None
                        }
                    },
                    None => None,
                };
                match stale {
                    Some(host) => {
                        self.caches[ty as usize].list.pop_back();
                        self.discard(ty, host);
                    },
                    None => break,
                }
            }
        }
    }

    /// Open a mass-update bracket: population gauges freeze until the
    /// matching [`Hcache::stop_mass_update`].
    pub fn start_mass_update(&mut self, ty: CacheType) {
        self.caches[ty as usize].mass_update += 1;
    }

    /// Close a mass-update bracket, refreshing the catcher gauge once.
    pub fn stop_mass_update(&mut self, ty: CacheType) {
        if self.caches[ty as usize].mass_update == 0 {
            tracing::warn!(cache = %ty, "mass update stopped but never started");
            return;
        }
        self.caches[ty as usize].mass_update -= 1;
        if self.caches[ty as usize].mass_update > 0 {
            return;
        }
        let value = match ty.catcher() {
            Catcher::Any => self.size(HostKind::Any),
            Catcher::Ultra => self.size(HostKind::Ultra),
            Catcher::Bad => CacheType::ALL
                .iter()
                .filter(|t| t.is_bad())
                .map(|t| self.caches[*t as usize].list.len())
                .sum(),
            Catcher::Guess => self.caches[CacheType::Guess as usize].list.len(),
            Catcher::GuessIntro => self.caches[CacheType::GuessIntro as usize].list.len(),
        };
        *self.populations.slot_mut(ty.catcher()) = value;
    }

    /// Two-phase drain: empty every bucket under mass update, with the
    /// valid-to-fresh splice disabled, then drop the subscribers.
    pub fn close(&mut self) {
        self.closing = true;
        for &ty in CacheType::ALL.iter() {
            self.clear(ty);
        }
        self.subscribers.clear();
    }

    /// Persist a kind if either half changed since the last store.
    ///
    /// The valid half is written first, then the fresh half, each sorted by
    /// descending insertion time. The dirty flags survive a write failure.
    pub fn store_if_dirty(&mut self, kind: HostKind, path: &std::path::Path) {
        let (fresh, valid) = (kind.fresh() as usize, kind.valid() as usize);
        if !self.caches[fresh].dirty && !self.caches[valid].dirty {
            return;
        }
        let lines = self
            .sorted_hosts(kind.valid())
            .into_iter()
            .chain(self.sorted_hosts(kind.fresh()));
        match store::write(path, lines) {
            Ok(()) => {
                self.caches[fresh].dirty = false;
                self.caches[valid].dirty = false;
            },
            Err(e) => {
                tracing::warn!(err = %e, path = %path.display(), "host cache not persisted")
            },
        }
    }

    /// Load a kind's host file through the normal admission path.
    ///
    /// Timestamps that are unparsable, in the future, or more than 30
    /// minutes old are clamped to thirty minutes ago. The fresh half is
    /// re-sorted by descending insertion time afterwards.
    pub fn retrieve<N>(
        &mut self,
        net: &N,
        kind: HostKind,
        path: &std::path::Path,
        now: Timestamp,
    ) -> Result<usize, store::Error>
    where
        N: NetworkView,
    {
        let fresh = kind.fresh();
        let mut loaded = 0;
        for (host, stamp) in store::read(path)? {
            let added = match stamp {
                Some(t) if t <= now && now - t <= EXPIRY_SECS => t,
                _ => now - EXPIRY_SECS,
            };
            if self.add_at(net, fresh, host, added, now, "retrieved") {
                loaded += 1;
            }
        }
        self.sort_by_added(fresh);
        Ok(loaded)
    }

    /// Re-sort a bucket by descending insertion time.
    pub fn sort_by_added(&mut self, ty: CacheType) {
        let Self {
            caches,
            hosts,
            guess,
            ..
        } = self;
        let table = match ty.class() {
            CacheClass::Host => &*hosts,
            CacheClass::Guess => &*guess,
        };
        caches[ty as usize].list.sort_by(|a, b| {
            let ta = table.get(a).map(|e| e.added);
            let tb = table.get(b).map(|e| e.added);
            tb.cmp(&ta)
        });
    }

    /// Metadata of `host` within `class`, if cached.
    pub fn metadata(&self, class: CacheClass, host: &Host) -> Option<HostEntry> {
        self.table(class).get(host).copied()
    }

    pub fn cache_stats(&self, ty: CacheType) -> CacheStats {
        self.caches[ty as usize].stats()
    }

    pub fn populations(&self) -> Populations {
        self.populations
    }

    pub fn drops(&self) -> AdmissionDrops {
        self.drops
    }

    pub fn low_on_pongs(&self) -> bool {
        self.low_on_pongs
    }

    /// Override the low-on-pongs flag until the next recomputation. The
    /// protocol layer flips this while pong supply is throttled.
    pub fn set_low_on_pongs(&mut self, low: bool) {
        self.low_on_pongs = low;
    }

    /// The admission path. `added` is the insertion timestamp recorded for
    /// the host; loads from disk pass the stored one.
    fn add_at<N>(
        &mut self,
        net: &N,
        ty: CacheType,
        host: Host,
        added: Timestamp,
        now: Timestamp,
        label: &str,
    ) -> bool
    where
        N: NetworkView,
    {
        {
            let cfg = self.config.read();
            if cfg.stop_host_get {
                return false;
            }
            if ty == CacheType::Unstable && (!cfg.node_monitor_unstable_ip || self.low_on_pongs) {
                return false;
            }
        }
        if net.local_host().map_or(false, |me| me == host) {
            self.drops.local_instance += 1;
            return false;
        }
        if ty.is_good() && net.is_connected(&host) {
            self.drops.already_connected += 1;
            return false;
        }
        if !host::is_routable(&host.addr()) && (!ty.addr_only() || !host::port_is_valid(host.port()))
        {
            self.drops.invalid_host += 1;
            return false;
        }
        if net.is_bogus(&host.addr()) || net.is_hostile(&host.addr()) {
            self.drops.invalid_host += 1;
            return false;
        }
        // Most servents still listen on the default ports, which are the
        // first thing address harvesters probe. Admit only a fraction of
        // them unless we are starved for hosts.
        if (6346..=6350).contains(&host.port())
            && !self.low_on_pongs
            && self.rng.gen::<u8>() > 31
        {
            return false;
        }

        // From here on, address-only classes are keyed on port 0.
        let host = if ty.addr_only() { host.with_port(0) } else { host };

        if let Some(entry) = self.table(ty.class()).get(&host).copied() {
            return self.admit_duplicate(ty, entry.cache, host, now);
        }

        let caught = Caught { cache: ty, host };
        for notify in &self.subscribers {
            notify(&caught);
        }

        if !self.slot_accepts(ty) {
            return true;
        }

        self.table_mut(ty.class())
            .insert(host, HostEntry { cache: ty, added });
        let idx = ty as usize;
        self.caches[idx].list.push_front(host);
        self.caches[idx].misses += 1;
        self.caches[idx].dirty = true;
        if !self.caches[idx].in_mass_update() {
            *self.populations.slot_mut(ty.catcher()) += 1;
        }
        if self.config.read().hcache_debug > 8 {
            tracing::debug!(cache = %ty, host = %host, label = %label, "caught host");
        }
        self.prune(ty);
        self.recompute_low_on_pongs();
        true
    }

    /// The host is already known within the class; resolve by target type.
    fn admit_duplicate(
        &mut self,
        requested: CacheType,
        current: CacheType,
        host: Host,
        now: Timestamp,
    ) -> bool {
        match requested {
            CacheType::Timeout | CacheType::Busy | CacheType::Unstable | CacheType::Alien => {
                self.caches[current as usize].hits += 1;
                if !current.is_bad() {
                    self.move_host(current, requested, host, now);
                }
            },
            CacheType::FreshUltra | CacheType::ValidUltra => {
                self.caches[current as usize].hits += 1;
                if matches!(current, CacheType::FreshAny | CacheType::ValidAny) {
                    self.move_host(current, requested, host, now);
                }
            },
            CacheType::Guess | CacheType::GuessIntro => {
                // ID smearing: a repeated introduction of a known GUESS host
                // is the signature of pong-cache poisoning. Drop what we
                // have rather than refresh it.
                if self.config.read().guess_server_debug > 1 {
                    tracing::debug!(host = %host, cache = %current, "smearing duplicate GUESS host");
                }
                if self.caches[current as usize].list.remove(&host) {
                    self.discard(current, host);
                }
            },
            CacheType::FreshAny | CacheType::ValidAny => {
                self.caches[current as usize].hits += 1;
            },
        }
        true
    }

    /// Unlink from `from`, prepend to `to`, refresh the metadata.
    fn move_host(&mut self, from: CacheType, to: CacheType, host: Host, now: Timestamp) {
        if !self.caches[from as usize].list.remove(&host) {
            tracing::warn!(host = %host, cache = %from, "host to move was not in its cache");
        }
        self.caches[to as usize].list.push_front(host);
        if let Some(entry) = self.table_mut(to.class()).get_mut(&host) {
            entry.cache = to;
            entry.added = now;
        }
        self.caches[from as usize].dirty = true;
        self.caches[to as usize].dirty = true;
        if from.catcher() != to.catcher() {
            if !self.caches[from as usize].in_mass_update() {
                let slot = self.populations.slot_mut(from.catcher());
                *slot = slot.saturating_sub(1);
            }
            if !self.caches[to as usize].in_mass_update() {
                *self.populations.slot_mut(to.catcher()) += 1;
            }
        }
        self.prune(to);
        self.recompute_low_on_pongs();
    }

    /// Bookkeeping for a host already unlinked from `ty`'s list.
    fn discard(&mut self, ty: CacheType, host: Host) {
        if self.table_mut(ty.class()).remove(&host).is_none() {
            tracing::warn!(host = %host, cache = %ty, "removed host had no metadata entry");
        }
        self.caches[ty as usize].dirty = true;
        if !self.caches[ty as usize].in_mass_update() {
            let slot = self.populations.slot_mut(ty.catcher());
            *slot = slot.saturating_sub(1);
        }
        self.recompute_low_on_pongs();
    }

    /// Probability-gated slot filter: linear in the free capacity once the
    /// bucket is half full. At or beyond capacity the newcomer is admitted
    /// anyway and [`Hcache::prune`] reclaims the tail -- the newest host
    /// wins.
    fn slot_accepts(&mut self, ty: CacheType) -> bool {
        let limit = self.config.read().max_hosts(ty);
        if limit == 0 {
            return false;
        }
        let len = self.caches[ty as usize].list.len();
        if len >= limit {
            return true;
        }
        let left = limit - len;
        left > limit / 2 || self.rng.gen_range(0..limit) < left
    }

    /// Reclaim overflow. For the good caches the longer half of the pair is
    /// pruned; GUESS pools evict just behind the head 70% of the time to
    /// blend poisoning resistance with freshness.
    fn prune(&mut self, ty: CacheType) {
        let limit = self.config.read().max_hosts(ty);
        let target = match ty.sibling() {
            Some(s) if self.caches[s as usize].list.len() > self.caches[ty as usize].list.len() => {
                s
            },
            _ => ty,
        };
        while self.caches[target as usize].list.len() > limit {
            let near_head = matches!(target, CacheType::Guess | CacheType::GuessIntro)
                && self.rng.gen_range(0..100u32) < 70;
            let cache = &mut self.caches[target as usize];
            let victim = if near_head && cache.list.len() >= 2 {
                cache.list.remove_at(1)
            } else {
                cache.list.pop_back()
            };
            match victim {
                Some(host) => self.discard(target, host),
                None => {
                    // Cannot happen while len > limit; noisy if it does.
                    tracing::error!(cache = %target, "prune asked to evict from an empty cache");
                    break;
                },
            }
        }
    }

    /// Splice the valid half into an empty fresh half.
    fn require_fresh(&mut self, kind: HostKind) {
        if self.closing {
            return;
        }
        let fresh = kind.fresh();
        let valid = kind.valid();
        if !self.caches[fresh as usize].list.is_empty()
            || self.caches[valid as usize].list.is_empty()
        {
            return;
        }
        let mut moved = std::mem::take(&mut self.caches[valid as usize].list);
        {
            let table = self.table_mut(fresh.class());
            for host in moved.iter() {
                if let Some(entry) = table.get_mut(host) {
                    entry.cache = fresh;
                }
            }
        }
        tracing::debug!(from = %valid, to = %fresh, n = moved.len(), "fresh half empty, splicing");
        self.caches[fresh as usize].list.append_back(&mut moved);
        self.caches[fresh as usize].dirty = true;
        self.caches[valid as usize].dirty = true;
    }

    fn sorted_hosts(&self, ty: CacheType) -> Vec<(Host, Timestamp)> {
        let table = self.table(ty.class());
        self.caches[ty as usize]
            .list
            .iter()
            .filter_map(|host| table.get(host).map(|e| (*host, e.added)))
            .sorted_by(|a, b| b.1.cmp(&a.1))
            .collect()
    }

    fn recompute_low_on_pongs(&mut self) {
        let threshold = (self.config.read().max_hosts_cached / 8).max(1);
        self.low_on_pongs = self.size(HostKind::Any) < threshold;
    }

    fn table(&self, class: CacheClass) -> &FxHashMap<Host, HostEntry> {
        match class {
            CacheClass::Host => &self.hosts,
            CacheClass::Guess => &self.guess,
        }
    }

    fn table_mut(&mut self, class: CacheClass) -> &mut FxHashMap<Host, HostEntry> {
        match class {
            CacheClass::Host => &mut self.hosts,
            CacheClass::Guess => &mut self.guess,
        }
    }
}

#[cfg(test)]
mod test {
    use std::{cell::RefCell, rc::Rc};

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use proptest::{collection, prelude::*};
    use rand::SeedableRng as _;
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::config::Config;

    fn config() -> Config {
        Config::default()
    }

    fn hcache(config: Config) -> Hcache<Pcg64Mcg> {
        Hcache::new(config.shared(), Pcg64Mcg::seed_from_u64(42))
    }

    fn h(s: &str) -> Host {
        s.parse().expect("test host parses")
    }

    #[derive(Default)]
    struct Net {
        me: Option<Host>,
        connected: Vec<Host>,
        hostile: Vec<IpAddr>,
        bogus: Vec<IpAddr>,
        nearby: Vec<IpAddr>,
    }

    impl NetworkView for Net {
        fn local_host(&self) -> Option<Host> {
            self.me
        }

        fn is_connected(&self, host: &Host) -> bool {
            self.connected.contains(host)
        }

        fn is_bogus(&self, addr: &IpAddr) -> bool {
            self.bogus.contains(addr)
        }

        fn is_hostile(&self, addr: &IpAddr) -> bool {
            self.hostile.contains(addr)
        }

        fn is_nearby(&self, addr: &IpAddr) -> bool {
            self.nearby.contains(addr)
        }
    }

    const NOW: Timestamp = Timestamp::from_unix(1_600_000_000);

    #[test]
    fn default_port_host_admitted_when_low_on_pongs() {
        let mut hc = hcache(Config {
            max_hosts_cached: 2,
            ..config()
        });
        hc.set_low_on_pongs(true);

        assert!(hc.add(&(), CacheType::FreshAny, h("1.2.3.4:6347"), NOW, "test"));
        assert_eq!(hc.size(HostKind::Any), 1);
        assert_eq!(hc.fill_caught_array(HostKind::Any, 4), vec![h("1.2.3.4:6347")]);
        assert_eq!(
            hc.metadata(CacheClass::Host, &h("1.2.3.4:6347")),
            Some(HostEntry {
                cache: CacheType::FreshAny,
                added: NOW
            })
        );
    }

    #[test]
    fn overflow_evicts_the_tail() {
        let mut hc = hcache(Config {
            max_hosts_cached: 2,
            ..config()
        });

        // The slot filter thins admissions past half-full, so feed distinct
        // hosts until the bucket is at capacity.
        let mut port = 5000;
        while hc.size(HostKind::Any) < 2 {
            assert!(port < 5100, "slot filter starved the fill loop");
            assert!(hc.add(
                &(),
                CacheType::FreshAny,
                h(&format!("9.9.9.9:{}", port)),
                NOW,
                "fill"
            ));
            port += 1;
        }
        let before = hc.fill_caught_array(HostKind::Any, 4);
        let tail = *before.last().expect("cache is full");

        let newcomer = h("9.9.9.10:5999");
        assert!(hc.add(&(), CacheType::FreshAny, newcomer, NOW, "overflow"));
        let after = hc.fill_caught_array(HostKind::Any, 4);

        assert_eq!(hc.size(HostKind::Any), 2);
        assert_eq!(after[0], newcomer);
        assert!(!after.contains(&tail));
        assert!(hc.metadata(CacheClass::Host, &tail).is_none());
    }

    #[test]
    fn guess_readd_smears_the_entry() {
        let mut hc = hcache(config());
        let host = h("4.4.4.4:7777");

        assert!(hc.add(&(), CacheType::Guess, host, NOW, "qk"));
        assert_eq!(hc.cache_stats(CacheType::Guess).len, 1);

        assert!(hc.add(&(), CacheType::Guess, host, NOW, "qk"));
        assert_eq!(hc.cache_stats(CacheType::Guess).len, 0);
        assert!(hc.metadata(CacheClass::Guess, &host).is_none());
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let mut hc = hcache(config());
        let host = h("5.5.5.5:7000");

        assert!(hc.add(&(), CacheType::FreshAny, host, NOW, "pong"));
        assert!(hc.add(&(), CacheType::FreshAny, host, NOW, "pong"));

        let stats = hc.cache_stats(CacheType::FreshAny);
        assert_eq!((stats.len, stats.misses, stats.hits), (1, 1, 1));
    }

    #[test]
    fn any_host_promotes_to_ultra() {
        let mut hc = hcache(config());
        let host = h("6.6.6.6:7000");

        assert!(hc.add(&(), CacheType::FreshAny, host, NOW, "pong"));
        assert!(hc.add(&(), CacheType::FreshUltra, host, NOW + 5, "header"));

        assert_eq!(
            hc.metadata(CacheClass::Host, &host),
            Some(HostEntry {
                cache: CacheType::FreshUltra,
                added: NOW + 5
            })
        );
        assert_eq!(hc.size(HostKind::Any), 0);
        assert_eq!(hc.size(HostKind::Ultra), 1);
        assert_eq!(hc.populations().any, 0);
        assert_eq!(hc.populations().ultra, 1);
    }

    #[test]
    fn ultra_host_is_not_demoted_by_any_add() {
        let mut hc = hcache(config());
        let host = h("6.6.6.7:7000");

        assert!(hc.add(&(), CacheType::FreshUltra, host, NOW, "header"));
        assert!(hc.add(&(), CacheType::FreshAny, host, NOW + 5, "pong"));

        assert_matches!(
            hc.metadata(CacheClass::Host, &host),
            Some(HostEntry {
                cache: CacheType::FreshUltra,
                ..
            })
        );
    }

    #[test]
    fn good_host_is_captured_by_alien() {
        let mut hc = hcache(config());
        let host = h("7.7.7.7:7000");

        assert!(hc.add(&(), CacheType::FreshAny, host, NOW, "pong"));
        assert!(hc.add(&(), CacheType::Alien, host, NOW + 1, "handshake"));

        assert_eq!(
            hc.metadata(CacheClass::Host, &host).map(|e| e.cache),
            Some(CacheType::Alien)
        );
        assert_eq!(hc.size(HostKind::Any), 0);
        assert_eq!(hc.populations().bad, 1);
    }

    #[test]
    fn bad_host_stays_in_its_bucket() {
        let mut hc = hcache(config());
        let addr = h("8.8.8.8:7000");

        assert!(hc.add(&(), CacheType::Timeout, addr, NOW, "timeout"));
        assert!(hc.add(&(), CacheType::Busy, addr, NOW + 1, "busy"));

        assert_eq!(hc.cache_stats(CacheType::Timeout).len, 1);
        assert_eq!(hc.cache_stats(CacheType::Busy).len, 0);
        assert_eq!(hc.cache_stats(CacheType::Timeout).hits, 1);
        assert!(hc.node_is_bad("8.8.8.8".parse().unwrap()));
        assert!(!hc.node_is_bad("8.8.4.4".parse().unwrap()));
    }

    #[test]
    fn unstable_admission_is_gated() {
        let mut hc = hcache(Config {
            node_monitor_unstable_ip: false,
            ..config()
        });
        hc.set_low_on_pongs(false);
        assert!(!hc.add(&(), CacheType::Unstable, h("9.9.9.9:7000"), NOW, "flaky"));

        let mut hc = hcache(config());
        hc.set_low_on_pongs(true);
        assert!(!hc.add(&(), CacheType::Unstable, h("9.9.9.9:7000"), NOW, "flaky"));

        hc.set_low_on_pongs(false);
        assert!(hc.add(&(), CacheType::Unstable, h("9.9.9.9:7000"), NOW, "flaky"));
        assert!(hc.node_is_bad("9.9.9.9".parse().unwrap()));
    }

    #[test]
    fn stop_host_get_disables_admission() {
        let shared = Config::default().shared();
        let mut hc = Hcache::new(shared.clone(), Pcg64Mcg::seed_from_u64(42));

        shared.write().stop_host_get = true;
        assert!(!hc.add(&(), CacheType::FreshAny, h("1.2.3.4:7000"), NOW, "pong"));

        shared.write().stop_host_get = false;
        assert!(hc.add(&(), CacheType::FreshAny, h("1.2.3.4:7000"), NOW, "pong"));
    }

    #[test]
    fn own_and_connected_hosts_are_rejected() {
        let mut hc = hcache(config());
        let me = h("2.2.2.2:6355");
        let peer = h("3.3.3.3:6355");
        let net = Net {
            me: Some(me),
            connected: vec![peer],
            ..Net::default()
        };

        assert!(!hc.add(&net, CacheType::FreshAny, me, NOW, "pong"));
        assert!(!hc.add(&net, CacheType::FreshAny, peer, NOW, "pong"));
        assert_eq!(hc.drops().local_instance, 1);
        assert_eq!(hc.drops().already_connected, 1);
        // Behaviour buckets do not care about live connections.
        assert!(hc.add(&net, CacheType::Timeout, peer, NOW, "timeout"));
    }

    #[test]
    fn unroutable_addresses_only_enter_addr_only_buckets_with_a_port() {
        let mut hc = hcache(config());
        let private = h("192.168.1.1:7000");

        assert!(!hc.add(&(), CacheType::FreshAny, private, NOW, "pong"));
        assert_eq!(hc.drops().invalid_host, 1);

        // Keyed by address, but the caller-supplied port must be real.
        assert!(hc.add(&(), CacheType::Timeout, private, NOW, "timeout"));
        assert!(hc.node_is_bad("192.168.1.1".parse().unwrap()));
        assert!(!hc.add(&(), CacheType::Busy, private.with_port(0), NOW, "busy"));
    }

    #[test]
    fn hostile_and_bogus_addresses_are_rejected() {
        let mut hc = hcache(config());
        let net = Net {
            hostile: vec!["66.66.66.66".parse().unwrap()],
            bogus: vec!["55.55.55.55".parse().unwrap()],
            ..Net::default()
        };

        assert!(!hc.add(&net, CacheType::FreshAny, h("66.66.66.66:7000"), NOW, "pong"));
        assert!(!hc.add(&net, CacheType::FreshAny, h("55.55.55.55:7000"), NOW, "pong"));
        assert_eq!(hc.drops().invalid_host, 2);
    }

    #[test]
    fn default_ports_are_mostly_vetoed_when_not_low() {
        let mut hc = hcache(config());
        let mut rejected = 0;
        for i in 0..100u32 {
            hc.set_low_on_pongs(false);
            let host = h(&format!("20.0.{}.{}:6346", i / 256, i % 256));
            if !hc.add(&(), CacheType::FreshAny, host, NOW, "pong") {
                rejected += 1;
            }
        }
        // ≈87.5% expected; anything past half shows the veto is live.
        assert!(rejected > 50, "only {} of 100 rejected", rejected);
    }

    #[test]
    fn behaviour_buckets_expire_after_thirty_minutes() {
        let mut hc = hcache(config());
        assert!(hc.add(&(), CacheType::Timeout, h("1.1.1.1:7000"), NOW, "timeout"));
        assert!(hc.add(&(), CacheType::Timeout, h("1.1.1.2:7000"), NOW + 60, "timeout"));

        hc.expire(NOW + EXPIRY_SECS);
        assert_eq!(hc.cache_stats(CacheType::Timeout).len, 2);

        hc.expire(NOW + EXPIRY_SECS + 1);
        assert_eq!(hc.cache_stats(CacheType::Timeout).len, 1);
        assert!(!hc.node_is_bad("1.1.1.1".parse().unwrap()));
        assert!(hc.node_is_bad("1.1.1.2".parse().unwrap()));

        hc.expire(NOW + 61 + EXPIRY_SECS);
        assert_eq!(hc.cache_stats(CacheType::Timeout).len, 0);
        assert_eq!(hc.populations().bad, 0);
    }

    #[test]
    fn get_caught_is_lifo_and_splices_the_valid_half() {
        let mut hc = hcache(config());
        assert!(hc.add_valid(&(), HostKind::Any, h("1.0.0.1:7000"), NOW, "valid"));
        assert!(hc.add_valid(&(), HostKind::Any, h("1.0.0.2:7000"), NOW + 1, "valid"));
        assert!(hc.add_caught(&(), HostKind::Any, h("1.0.0.3:7000"), NOW + 2, "pong"));

        // The fresh half drains first, newest first.
        assert_eq!(hc.get_caught(&(), HostKind::Any), Some(h("1.0.0.3:7000")));
        // Fresh is empty: the valid half is spliced in and rewritten.
        assert_eq!(hc.get_caught(&(), HostKind::Any), Some(h("1.0.0.2:7000")));
        assert_eq!(
            hc.metadata(CacheClass::Host, &h("1.0.0.1:7000")).map(|e| e.cache),
            Some(CacheType::FreshAny)
        );
        assert_eq!(hc.get_caught(&(), HostKind::Any), Some(h("1.0.0.1:7000")));
        assert_eq!(hc.get_caught(&(), HostKind::Any), None);
        assert_eq!(hc.size(HostKind::Any), 0);
    }

    #[test]
    fn nearby_hosts_are_preferred_when_netmasks_are_used() {
        let mut hc = hcache(Config {
            use_netmasks: true,
            ..config()
        });
        let net = Net {
            nearby: vec!["30.0.0.2".parse().unwrap()],
            ..Net::default()
        };
        for host in &["30.0.0.1:7000", "30.0.0.2:7000", "30.0.0.3:7000"] {
            assert!(hc.add_caught(&net, HostKind::Any, h(host), NOW, "pong"));
        }

        assert_eq!(hc.get_caught(&net, HostKind::Any), Some(h("30.0.0.2:7000")));
        assert_eq!(hc.get_caught(&net, HostKind::Any), Some(h("30.0.0.3:7000")));
        assert_eq!(hc.size(HostKind::Any), 1);
    }

    #[test]
    fn caught_subscribers_see_new_hosts_only() {
        let mut hc = hcache(config());
        let seen: Rc<RefCell<Vec<Caught>>> = Rc::default();
        let sink = Rc::clone(&seen);
        hc.on_caught(move |caught| sink.borrow_mut().push(*caught));

        let host = h("12.0.0.1:7000");
        assert!(hc.add(&(), CacheType::FreshAny, host, NOW, "pong"));
        assert!(hc.add(&(), CacheType::FreshAny, host, NOW, "pong"));

        assert_eq!(
            *seen.borrow(),
            vec![Caught {
                cache: CacheType::FreshAny,
                host
            }]
        );
    }

    #[test]
    fn close_drains_everything() {
        let mut hc = hcache(config());
        assert!(hc.add(&(), CacheType::FreshAny, h("1.0.1.1:7000"), NOW, "pong"));
        assert!(hc.add_valid(&(), HostKind::Ultra, h("1.0.1.2:7000"), NOW, "header"));
        assert!(hc.add(&(), CacheType::Timeout, h("1.0.1.3:7000"), NOW, "timeout"));
        assert!(hc.add(&(), CacheType::Guess, h("1.0.1.4:7000"), NOW, "qk"));

        hc.close();

        for &ty in CacheType::ALL.iter() {
            assert_eq!(hc.cache_stats(ty).len, 0, "{}", ty);
        }
        assert_eq!(hc.populations(), Populations::default());
        assert_eq!(hc.size(HostKind::Any), 0);
    }

    #[test]
    fn clear_kind_resets_the_population_gauge() {
        let mut hc = hcache(config());
        for i in 1..=3 {
            assert!(hc.add_caught(&(), HostKind::Any, h(&format!("1.0.2.{}:7000", i)), NOW, "pong"));
        }
        assert_eq!(hc.populations().any, 3);

        hc.clear_kind(HostKind::Any);
        assert_eq!(hc.populations().any, 0);
        assert_eq!(hc.size(HostKind::Any), 0);
    }

    #[test]
    fn purge_only_touches_good_caches() {
        let mut hc = hcache(config());
        let good = h("1.0.3.1:7000");
        let bad = h("1.0.3.2:7000");
        assert!(hc.add(&(), CacheType::FreshAny, good, NOW, "pong"));
        assert!(hc.add(&(), CacheType::Alien, bad, NOW, "handshake"));

        hc.purge(good);
        hc.purge(bad);

        assert!(hc.metadata(CacheClass::Host, &good).is_none());
        assert_eq!(
            hc.metadata(CacheClass::Host, &bad).map(|e| e.cache),
            Some(CacheType::Alien)
        );
    }

    #[test]
    fn store_then_retrieve_is_a_subset_with_sane_timestamps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = Paths::from_root(dir.path()).expect("paths");

        let mut hc = hcache(config());
        assert!(hc.add_caught(&(), HostKind::Any, h("1.0.4.1:7000"), NOW - 60, "pong"));
        assert!(hc.add_caught(&(), HostKind::Any, h("1.0.4.2:7000"), NOW - 30, "pong"));
        assert!(hc.add_valid(&(), HostKind::Any, h("1.0.4.3:7000"), NOW - 90, "valid"));
        let original = hc.fill_caught_array(HostKind::Any, 8);

        hc.store_if_dirty(HostKind::Any, paths.for_kind(HostKind::Any));

        let mut back = hcache(config());
        let loaded = back
            .retrieve(&(), HostKind::Any, paths.for_kind(HostKind::Any), NOW)
            .expect("retrieve succeeds");
        assert_eq!(loaded, 3);

        let restored = back.fill_caught_array(HostKind::Any, 8);
        assert!(restored.iter().all(|host| original.contains(host)));
        for host in &restored {
            let entry = back.metadata(CacheClass::Host, host).expect("metadata");
            assert!(entry.added <= NOW);
            assert_eq!(entry.cache, CacheType::FreshAny);
        }
        // Descending insertion time after the load (newest first).
        let times = restored
            .iter()
            .map(|host| back.metadata(CacheClass::Host, host).expect("metadata").added)
            .collect::<Vec<_>>();
        let mut sorted = times.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(times, sorted);
    }

    #[test]
    fn retrieve_clamps_bad_timestamps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hosts");
        let future = (NOW + 3600).to_utc_string();
        let stale = (NOW - 2 * EXPIRY_SECS).to_utc_string();
        std::fs::write(
            &path,
            format!(
                "1.0.5.1:7000 {}\n1.0.5.2:7000 {}\n1.0.5.3:7000 garbage\n",
                future, stale
            ),
        )
        .expect("fixture written");

        let mut hc = hcache(config());
        hc.retrieve(&(), HostKind::Any, &path, NOW).expect("retrieve");

        for i in 1..=3 {
            let entry = hc
                .metadata(CacheClass::Host, &h(&format!("1.0.5.{}:7000", i)))
                .expect("loaded");
            assert_eq!(entry.added, NOW - EXPIRY_SECS, "host {}", i);
        }
    }

    #[test]
    fn dirty_flags_survive_a_failed_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut hc = hcache(config());
        assert!(hc.add_caught(&(), HostKind::Any, h("1.0.6.1:7000"), NOW, "pong"));

        hc.store_if_dirty(HostKind::Any, &dir.path().join("no/such/dir/hosts"));
        let good = dir.path().join("hosts");
        hc.store_if_dirty(HostKind::Any, &good);

        let written = std::fs::read_to_string(&good).expect("file exists");
        assert!(written.contains("1.0.6.1:7000"));

        // Both halves clean now: a further store is a no-op.
        std::fs::remove_file(&good).expect("removed");
        hc.store_if_dirty(HostKind::Any, &good);
        assert!(!good.exists());
    }

    #[test]
    fn guess_pools_stay_within_their_cap() {
        let mut hc = hcache(Config {
            max_guess_hosts_cached: 8,
            ..config()
        });
        for i in 0..64u32 {
            hc.add(
                &(),
                CacheType::Guess,
                h(&format!("40.0.{}.{}:7000", i / 256, i % 256)),
                NOW + i64::from(i),
                "qk",
            );
        }
        assert!(hc.cache_stats(CacheType::Guess).len <= 8);
        assert_eq!(
            hc.populations().guess,
            hc.cache_stats(CacheType::Guess).len
        );
    }

    proptest! {
        // Hosts live in exactly one cache per class, metadata agrees with
        // placement, and the reported size is the union of the halves.
        #[test]
        fn membership_invariants_hold(
            ops in collection::vec((0usize..10, 0u8..16, 1u16..5), 0..64)
        ) {
            let mut hc = hcache(Config {
                max_hosts_cached: 8,
                max_ultra_hosts_cached: 8,
                max_bad_hosts_cached: 8,
                max_guess_hosts_cached: 8,
                max_guess_intro_hosts_cached: 8,
                ..Config::default()
            });
            for (ty, octet, port) in ops {
                let ty = CacheType::ALL[ty];
                let host = h(&format!("50.0.0.{}:{}", octet, 7000 + port));
                hc.add(&(), ty, host, NOW, "prop");
            }

            let mut host_class = 0usize;
            let mut guess_class = 0usize;
            for &ty in CacheType::ALL.iter() {
                let len = hc.cache_stats(ty).len;
                match ty.class() {
                    CacheClass::Host => host_class += len,
                    CacheClass::Guess => guess_class += len,
                }
                // Every listed host has a matching metadata entry.
                for host in hc.fill_caught_array_raw(ty) {
                    let entry = hc.metadata(ty.class(), &host).expect("entry exists");
                    prop_assert_eq!(entry.cache, ty);
                }
            }
            prop_assert_eq!(host_class, hc.table(CacheClass::Host).len());
            prop_assert_eq!(guess_class, hc.table(CacheClass::Guess).len());
            prop_assert_eq!(
                hc.size(HostKind::Any),
                hc.cache_stats(CacheType::FreshAny).len + hc.cache_stats(CacheType::ValidAny).len
            );
        }
    }

    impl Hcache<Pcg64Mcg> {
        /// Test helper: raw snapshot of one bucket's list.
        fn fill_caught_array_raw(&self, ty: CacheType) -> Vec<Host> {
            self.caches[ty as usize].list.iter().copied().collect()
        }
    }
}
