// Copyright © 2021 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of gnet, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Externally observable counters.
//!
//! The GUI layer of a client polls these; nothing in the core reads them
//! back. Populations are maintained as gauges (not recomputed on read) so
//! that mass updates can defer the refresh to a single point.

/// A named external population counter: one per "catcher" group of host
/// caches. The four behaviour buckets share one catcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Catcher {
    Any,
    Ultra,
    Bad,
    Guess,
    GuessIntro,
}

/// Gauge per catcher group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Populations {
    pub any: usize,
    pub ultra: usize,
    pub bad: usize,
    pub guess: usize,
    pub guess_intro: usize,
}

impl Populations {
    pub fn of(&self, catcher: Catcher) -> usize {
        match catcher {
            Catcher::Any => self.any,
            Catcher::Ultra => self.ultra,
            Catcher::Bad => self.bad,
            Catcher::Guess => self.guess,
            Catcher::GuessIntro => self.guess_intro,
        }
    }

    pub(crate) fn slot_mut(&mut self, catcher: Catcher) -> &mut usize {
        match catcher {
            Catcher::Any => &mut self.any,
            Catcher::Ultra => &mut self.ultra,
            Catcher::Bad => &mut self.bad,
            Catcher::Guess => &mut self.guess,
            Catcher::GuessIntro => &mut self.guess_intro,
        }
    }
}

/// Point-in-time counters of a single host cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Admissions that found the host already cached.
    pub hits: u64,
    /// Admissions that stored a new host.
    pub misses: u64,
    pub len: usize,
}

/// Admission rejections by reason.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdmissionDrops {
    pub already_connected: u64,
    pub invalid_host: u64,
    pub local_instance: u64,
}
