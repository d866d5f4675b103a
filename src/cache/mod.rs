//! Cache levels and the inter-level miss protocol.
//!
//! Each level is a [`CacheLevel`] parameterised over its tag storage: a flat
//! set-indexed array for the common case, a map-backed set for single-set
//! caches with many ways. Levels are chained through [`Cache`] trait objects;
//! a miss propagates inward as a line-aligned refill, preceded by the dirty
//! victim's writeback when there is one.

use crate::config::CacheConfig;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

mod assoc;
mod fully_assoc;
mod lfsr;

pub use assoc::SetAssocTags;
pub use fully_assoc::FullyAssocTags;
pub use lfsr::Lfsr;

/// Tag bit marking a line as resident.
pub const VALID: u64 = 1 << 63;
/// Tag bit marking a resident line as modified since its refill.
pub const DIRTY: u64 = 1 << 62;

/// Per-level counters. All loads use relaxed ordering; the simulator is
/// synchronous and the atomics exist so levels can be shared behind `Arc`.
pub struct Statistics {
    pub read_accesses: AtomicU64,
    pub read_misses: AtomicU64,
    pub bytes_read: AtomicU64,
    pub write_accesses: AtomicU64,
    pub write_misses: AtomicU64,
    pub bytes_written: AtomicU64,
    pub writebacks: AtomicU64,
}

impl Statistics {
    pub const fn new() -> Self {
        Self {
            read_accesses: AtomicU64::new(0),
            read_misses: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            write_accesses: AtomicU64::new(0),
            write_misses: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            writebacks: AtomicU64::new(0),
        }
    }

    pub fn clear(&self) {
        self.read_accesses.store(0, Ordering::Relaxed);
        self.read_misses.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.write_accesses.store(0, Ordering::Relaxed);
        self.write_misses.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.writebacks.store(0, Ordering::Relaxed);
    }
}

/// Callback receiving the line-granular miss stream of the outermost
/// trace-enabled level: virtual line address, physical line address, line
/// size, and whether the triggering access was a store. This approximates
/// the address stream that would reach DRAM.
pub type MissCallback = dyn Fn(u64, u64, u64, bool) + Send + Sync;

/// Holder for the externally installed miss callback. One instance is
/// shared by every level of a hierarchy; only levels with miss tracing
/// enabled ever emit through it.
pub struct MissTraceEmitter {
    callback: RwLock<Option<Box<MissCallback>>>,
}

impl MissTraceEmitter {
    pub fn new() -> Self {
        MissTraceEmitter { callback: RwLock::new(None) }
    }

    pub fn install<F>(&self, callback: F)
    where
        F: Fn(u64, u64, u64, bool) + Send + Sync + 'static,
    {
        *self.callback.write() = Some(Box::new(callback));
    }

    /// Invoke the callback if one is installed. A miss with no callback is
    /// still counted by its level; nothing fires here.
    pub fn emit(&self, vaddr: u64, paddr: u64, linesz: u64, write: bool) {
        if let Some(callback) = &*self.callback.read() {
            callback(vaddr, paddr, linesz, write);
        }
    }
}

impl Default for MissTraceEmitter {
    fn default() -> Self {
        MissTraceEmitter::new()
    }
}

/// Storage backend of one level: the tag array and its victim selection.
pub trait TagStore: Send {
    /// Probe for the line containing `paddr`. On a hit, returns the
    /// resident slot's tag word so the caller can set DIRTY in place.
    /// A dirty line still hits; the comparison masks DIRTY.
    fn check_tag(&mut self, paddr: u64) -> Option<&mut u64>;

    /// Displace a pseudo-randomly chosen way in favour of the line
    /// containing `paddr`, recording `src` as its source address.
    /// Returns the displaced (tag, src) pair; the tag is zero when the
    /// chosen slot held nothing.
    fn victimize(&mut self, paddr: u64, src: u64) -> (u64, u64);
}

/// Uniform access contract of one cache level.
pub trait Cache: Send + Sync {
    /// Classify one access and, on a miss, drive the writeback/refill
    /// chain through the next level. The call completes the entire
    /// propagation before returning.
    fn access(&self, vaddr: u64, paddr: u64, bytes: u64, write: bool);

    /// Connect the next level. A level accepts at most one handler.
    fn set_miss_handler(&self, next: Arc<dyn Cache>);

    /// Start reporting misses at this level through the miss emitter.
    fn enable_trace_miss(&self);

    fn name(&self) -> &str;

    fn stats(&self) -> &Statistics;

    /// Emit the aggregated counters. Levels that saw no accesses stay
    /// silent.
    fn print_stats(&self, out: &mut dyn Write) -> io::Result<()> {
        let stats = self.stats();
        let reads = stats.read_accesses.load(Ordering::Relaxed);
        let writes = stats.write_accesses.load(Ordering::Relaxed);
        if reads + writes == 0 {
            return Ok(());
        }

        let misses = stats.read_misses.load(Ordering::Relaxed)
            + stats.write_misses.load(Ordering::Relaxed);
        let miss_rate = 100.0 * misses as f64 / (reads + writes) as f64;

        writeln!(out, "======== {} ========", self.name())?;
        writeln!(out, "Bytes Read: {}", stats.bytes_read.load(Ordering::Relaxed))?;
        writeln!(out, "Bytes Written: {}", stats.bytes_written.load(Ordering::Relaxed))?;
        writeln!(out, "Read Accesses: {}", reads)?;
        writeln!(out, "Write Accesses: {}", writes)?;
        writeln!(out, "Read Misses: {}", stats.read_misses.load(Ordering::Relaxed))?;
        writeln!(out, "Write Misses: {}", stats.write_misses.load(Ordering::Relaxed))?;
        writeln!(out, "Writebacks: {}", stats.writebacks.load(Ordering::Relaxed))?;
        writeln!(out, "Miss Rate: {:.3}", miss_rate)
    }
}

/// One level of the hierarchy, generic over its tag storage.
pub struct CacheLevel<T> {
    name: String,
    linesz: u64,
    idx_shift: u32,
    store: Mutex<T>,
    stats: Statistics,
    miss_handler: OnceCell<Arc<dyn Cache>>,
    trace_miss: AtomicBool,
    emitter: Arc<MissTraceEmitter>,
}

impl<T: TagStore> CacheLevel<T> {
    pub(crate) fn with_store(
        store: T,
        config: &CacheConfig,
        name: &str,
        emitter: Arc<MissTraceEmitter>,
    ) -> Self {
        debug!(
            "{}: {} sets, {} ways, {} byte lines",
            name, config.sets, config.ways, config.linesz
        );
        CacheLevel {
            name: name.to_owned(),
            linesz: config.linesz,
            idx_shift: config.idx_shift(),
            store: Mutex::new(store),
            stats: Statistics::new(),
            miss_handler: OnceCell::new(),
            trace_miss: AtomicBool::new(false),
            emitter,
        }
    }
}

impl<T: TagStore> Cache for CacheLevel<T> {
    fn access(&self, vaddr: u64, paddr: u64, bytes: u64, write: bool) {
        if write {
            self.stats.write_accesses.fetch_add(1, Ordering::Relaxed);
            self.stats.bytes_written.fetch_add(bytes, Ordering::Relaxed);
        } else {
            self.stats.read_accesses.fetch_add(1, Ordering::Relaxed);
            self.stats.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        }

        let line_mask = !(self.linesz - 1);

        let mut store = self.store.lock();
        if let Some(tag) = store.check_tag(paddr) {
            if write {
                *tag |= DIRTY;
            }
            return;
        }

        if self.trace_miss.load(Ordering::Relaxed) {
            self.emitter.emit(vaddr & line_mask, paddr & line_mask, self.linesz, write);
        }

        if write {
            self.stats.write_misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.read_misses.fetch_add(1, Ordering::Relaxed);
        }

        let (victim, victim_src) = store.victimize(paddr, vaddr & line_mask);
        // Release the tag array before chaining into the next level.
        drop(store);

        if victim & (VALID | DIRTY) == VALID | DIRTY {
            let dirty_paddr = (victim & !(VALID | DIRTY)) << self.idx_shift;
            if let Some(next) = self.miss_handler.get() {
                next.access(victim_src, dirty_paddr, self.linesz, true);
            }
            self.stats.writebacks.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(next) = self.miss_handler.get() {
            next.access(vaddr & line_mask, paddr & line_mask, self.linesz, false);
        }

        if write {
            // The refill chain cannot touch this level's store, so the line
            // installed by victimize is still resident.
            match self.store.lock().check_tag(paddr) {
                Some(tag) => *tag |= DIRTY,
                None => unreachable!("line missing after refill"),
            }
        }
    }

    fn set_miss_handler(&self, next: Arc<dyn Cache>) {
        if self.miss_handler.set(next).is_err() {
            warn!("{}: miss handler already connected", self.name);
        }
    }

    fn enable_trace_miss(&self) {
        self.trace_miss.store(true, Ordering::Relaxed);
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> &Statistics {
        &self.stats
    }
}

pub type SetAssocCache = CacheLevel<SetAssocTags>;
pub type FullyAssocCache = CacheLevel<FullyAssocTags>;

/// Build a level from a validated configuration, choosing the map-backed
/// layout for single-set caches with many ways.
pub fn construct(
    config: &CacheConfig,
    name: &str,
    emitter: Arc<MissTraceEmitter>,
) -> Arc<dyn Cache> {
    if config.sets == 1 && config.ways > 4 {
        Arc::new(FullyAssocCache::new(config, name, emitter))
    } else {
        Arc::new(SetAssocCache::new(config, name, emitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    fn level(optstr: &str) -> Arc<dyn Cache> {
        let config = parse_config(optstr).unwrap();
        construct(&config, "D$", Arc::new(MissTraceEmitter::new()))
    }

    fn load(stats: &AtomicU64) -> u64 {
        stats.load(Ordering::Relaxed)
    }

    /// Next-level stand-in recording every access it receives.
    struct RecordingCache {
        calls: Mutex<Vec<(u64, u64, u64, bool)>>,
        stats: Statistics,
    }

    impl RecordingCache {
        fn new() -> Arc<Self> {
            Arc::new(RecordingCache { calls: Mutex::new(Vec::new()), stats: Statistics::new() })
        }

        fn calls(&self) -> Vec<(u64, u64, u64, bool)> {
            self.calls.lock().clone()
        }
    }

    impl Cache for RecordingCache {
        fn access(&self, vaddr: u64, paddr: u64, bytes: u64, write: bool) {
            self.calls.lock().push((vaddr, paddr, bytes, write));
        }

        fn set_miss_handler(&self, _next: Arc<dyn Cache>) {}

        fn enable_trace_miss(&self) {}

        fn name(&self) -> &str {
            "mem"
        }

        fn stats(&self) -> &Statistics {
            &self.stats
        }
    }

    #[test]
    fn test_hit_idempotence() {
        let cache = level("4:2:64");
        for _ in 0..100 {
            cache.access(0, 0x1000, 4, false);
        }
        assert_eq!(load(&cache.stats().read_accesses), 100);
        assert_eq!(load(&cache.stats().read_misses), 1);
        assert_eq!(load(&cache.stats().bytes_read), 400);
    }

    #[test]
    fn test_hits_within_one_line() {
        let cache = level("4:2:64");
        // Every byte of one 64-byte line.
        for offset in 0..64 {
            cache.access(0, 0x1000 + offset, 1, false);
        }
        assert_eq!(load(&cache.stats().read_misses), 1);
    }

    #[test]
    fn test_store_marks_line_dirty() {
        let next = RecordingCache::new();
        let cache = level("1:1:8");
        cache.set_miss_handler(next.clone());

        cache.access(0, 0x0, 1, true);
        // Refill only: a store miss fetches the line as a read, and the
        // dirtiness lives in this level until eviction.
        assert_eq!(next.calls(), vec![(0x0, 0x0, 8, false)]);

        cache.access(0x40, 0x40, 1, true);
        // The dirty victim is written back ahead of the refill, both
        // line-aligned.
        assert_eq!(
            next.calls(),
            vec![(0x0, 0x0, 8, false), (0x0, 0x0, 8, true), (0x40, 0x40, 8, false)]
        );
        assert_eq!(load(&cache.stats().writebacks), 1);
    }

    #[test]
    fn test_clean_eviction_skips_writeback() {
        let next = RecordingCache::new();
        let cache = level("1:1:8");
        cache.set_miss_handler(next.clone());

        cache.access(0, 0x0, 8, false);
        cache.access(0, 0x40, 8, false);
        assert_eq!(
            next.calls(),
            vec![(0x0, 0x0, 8, false), (0x40, 0x40, 8, false)]
        );
        assert_eq!(load(&cache.stats().writebacks), 0);
    }

    #[test]
    fn test_writeback_counted_without_next_level() {
        let cache = level("1:1:8");
        cache.access(0, 0x0, 1, true);
        cache.access(0, 0x40, 1, true);
        assert_eq!(load(&cache.stats().writebacks), 1);
    }

    #[test]
    fn test_writeback_carries_source_vaddr() {
        let next = RecordingCache::new();
        let cache = level("1:1:8");
        cache.set_miss_handler(next.clone());

        // Distinct virtual and physical addresses; the writeback must use
        // the virtual line recorded at refill time.
        cache.access(0xffff_1234, 0x100, 1, true);
        cache.access(0xeeee_0000, 0x140, 1, false);
        assert_eq!(
            next.calls(),
            vec![
                (0xffff_1230, 0x100, 8, false),
                (0xffff_1230, 0x100, 8, true),
                (0xeeee_0000, 0x140, 8, false),
            ]
        );
    }

    #[test]
    fn test_chained_addresses_line_aligned() {
        let next = RecordingCache::new();
        let cache = level("4:2:64");
        cache.set_miss_handler(next.clone());

        cache.access(0x7007, 0x3007, 2, true);
        cache.access(0x7088, 0x3088, 4, false);
        for (vaddr, paddr, bytes, _) in next.calls() {
            assert_eq!(vaddr % 64, 0);
            assert_eq!(paddr % 64, 0);
            assert_eq!(bytes, 64);
        }
    }

    #[test]
    fn test_miss_trace_fires_once_per_miss() {
        let emitter = Arc::new(MissTraceEmitter::new());
        let config = parse_config("1:1:8").unwrap();
        let cache: Arc<dyn Cache> = Arc::new(SetAssocCache::new(&config, "D$", emitter.clone()));

        let hits = Arc::new(Mutex::new(Vec::new()));
        let log = hits.clone();
        emitter.install(move |vaddr, paddr, linesz, write| {
            log.lock().push((vaddr, paddr, linesz, write));
        });

        // Tracing disabled: nothing fires.
        cache.access(0x1000, 0x1000, 1, false);
        assert!(hits.lock().is_empty());

        cache.enable_trace_miss();
        cache.access(0x1044, 0x1044, 1, false);
        cache.access(0x1044, 0x1044, 1, false);
        assert_eq!(hits.lock().clone(), vec![(0x1040, 0x1040, 8, false)]);
    }

    #[test]
    fn test_fully_assoc_dispatch() {
        // One set with many ways keeps all of them resident.
        let cache = level("1:8:64");
        for i in 0..8u64 {
            cache.access(0, i * 64, 1, false);
        }
        for i in 0..8u64 {
            cache.access(0, i * 64, 1, false);
        }
        assert_eq!(load(&cache.stats().read_accesses), 16);
        assert_eq!(load(&cache.stats().read_misses), 8);
    }

    #[test]
    fn test_print_stats_format() {
        let cache = level("1:1:8");
        cache.access(0, 0x0, 4, false);
        cache.access(0, 0x0, 4, false);
        cache.access(0, 0x8, 2, true);

        let mut out = Vec::new();
        cache.print_stats(&mut out).unwrap();
        let expected = "\
======== D$ ========
Bytes Read: 8
Bytes Written: 2
Read Accesses: 2
Write Accesses: 1
Read Misses: 1
Write Misses: 1
Writebacks: 0
Miss Rate: 66.667
";
        assert_eq!(String::from_utf8(out).unwrap(), expected);
    }

    #[test]
    fn test_print_stats_elided_when_idle() {
        let cache = level("1:1:8");
        let mut out = Vec::new();
        cache.print_stats(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_determinism_across_runs() {
        let run = || {
            let cache = level("2:2:64");
            // Enough conflicting lines to force victim selection.
            for i in 0..64u64 {
                cache.access(0, (i * 128) & 0xfff, 1, i % 3 == 0);
            }
            (
                load(&cache.stats().read_misses),
                load(&cache.stats().write_misses),
                load(&cache.stats().writebacks),
            )
        };
        assert_eq!(run(), run());
    }
}
