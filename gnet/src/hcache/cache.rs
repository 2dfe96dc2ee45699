// Copyright © 2021 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of gnet, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use super::CacheType;
use crate::{data::HashList, host::Host, stats::CacheStats};

/// One bucket of the host cache: an ordered host list (newest at the head)
/// plus its counters. Host metadata lives in the per-class table, not here.
pub(super) struct Cache {
    pub ty: CacheType,
    pub list: HashList<Host>,
    pub hits: u64,
    pub misses: u64,
    pub dirty: bool,
    pub mass_update: u32,
}

impl Cache {
    pub fn new(ty: CacheType) -> Self {
        Self {
            ty,
            list: HashList::new(),
            hits: 0,
            misses: 0,
            dirty: false,
            mass_update: 0,
        }
    }

    /// While a mass update is open, population gauges are not maintained
    /// per-removal; they are refreshed once when the bracket closes.
    pub fn in_mass_update(&self) -> bool {
        self.mass_update > 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            len: self.list.len(),
        }
    }
}
