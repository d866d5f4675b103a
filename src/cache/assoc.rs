use super::{CacheLevel, Lfsr, MissTraceEmitter, TagStore, DIRTY, VALID};
use crate::config::CacheConfig;
use std::sync::Arc;

/// Flat tag array for a direct-indexed, N-way set-associative level.
///
/// Tags and the parallel source array are `sets * ways` words addressed as
/// `idx * ways + way`. A tag word packs VALID, DIRTY, and the physical line
/// number; the source array remembers each resident line's virtual line
/// address so a dirty eviction can be traced back to its origin.
pub struct SetAssocTags {
    sets: usize,
    ways: usize,
    idx_shift: u32,
    tags: Box<[u64]>,
    srcs: Box<[u64]>,
    lfsr: Lfsr,
}

impl SetAssocTags {
    pub fn new(sets: usize, ways: usize, idx_shift: u32) -> Self {
        SetAssocTags {
            sets,
            ways,
            idx_shift,
            tags: vec![0; sets * ways].into_boxed_slice(),
            srcs: vec![0; sets * ways].into_boxed_slice(),
            lfsr: Lfsr::new(),
        }
    }

    fn index(&self, paddr: u64) -> usize {
        ((paddr >> self.idx_shift) & (self.sets as u64 - 1)) as usize
    }
}

impl TagStore for SetAssocTags {
    fn check_tag(&mut self, paddr: u64) -> Option<&mut u64> {
        let base = self.index(paddr) * self.ways;
        let tag = (paddr >> self.idx_shift) | VALID;

        for way in 0..self.ways {
            if self.tags[base + way] & !DIRTY == tag {
                return Some(&mut self.tags[base + way]);
            }
        }
        None
    }

    fn victimize(&mut self, paddr: u64, src: u64) -> (u64, u64) {
        let way = self.lfsr.next() as usize % self.ways;
        let slot = self.index(paddr) * self.ways + way;

        let victim = (self.tags[slot], self.srcs[slot]);
        self.tags[slot] = (paddr >> self.idx_shift) | VALID;
        self.srcs[slot] = src;
        victim
    }
}

impl CacheLevel<SetAssocTags> {
    pub fn new(config: &CacheConfig, name: &str, emitter: Arc<MissTraceEmitter>) -> Self {
        let store = SetAssocTags::new(config.sets, config.ways, config.idx_shift());
        CacheLevel::with_store(store, config, name, emitter)
    }
}
