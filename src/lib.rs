//! Trace-driven simulation of a multi-level CPU cache hierarchy.
//!
//! The host emulator feeds every guest memory operation through the front
//! door ([`cachesim_ld`], [`cachesim_st`], [`cachesim_fc`]). Each access is
//! classified hit or miss at every configured level; a miss propagates to
//! the next level as a line-aligned refill, preceded by the dirty victim's
//! writeback when one is displaced. The outermost configured level can
//! report its misses through an installed callback, approximating the
//! address stream that would reach DRAM.
//!
//! The global front door mirrors the host emulator's C-style lifecycle:
//! `init_cache_l1`/`l2`/`l3`, then [`init_cachesim`], then a stream of
//! ingest calls, then [`cachesim_destroy`] which emits per-level counters.
//! Hosts that want several independent hierarchies (one per guest thread,
//! say) use [`CacheHierarchy`] directly instead.

#[macro_use]
extern crate log;

pub mod cache;
pub mod config;
pub mod hierarchy;
pub mod tracer;

pub use crate::cache::{Cache, MissTraceEmitter, Statistics};
pub use crate::config::{parse_config, CacheConfig, Config, ConfigError};
pub use crate::hierarchy::{CacheHierarchy, Error};
pub use crate::tracer::{AccessEvent, AccessType};

use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

static SIMULATOR: Mutex<Option<CacheHierarchy>> = Mutex::new(None);
static ENABLED: AtomicBool = AtomicBool::new(false);

/// Whether the pipeline is live: `init_cachesim` has run and
/// `cachesim_destroy` has not. Ingest calls are dropped while this is
/// false.
pub fn cachesim_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

fn die(err: &Error) -> ! {
    eprintln!("{}", err);
    if let Error::Config(_) = err {
        eprintln!("{}", config::USAGE);
    }
    std::process::exit(1);
}

/// Construct the L1 instruction and data caches from one
/// `sets:ways:linesz` string. A malformed configuration is fatal.
pub fn init_cache_l1(optstr: &str) {
    let mut simulator = SIMULATOR.lock();
    let hierarchy = simulator.get_or_insert_with(CacheHierarchy::new);
    if let Err(err) = hierarchy.init_l1(optstr) {
        die(&err);
    }
}

/// Construct the unified L2. Fatal if the L1 caches are not built yet.
pub fn init_cache_l2(optstr: &str) {
    let mut simulator = SIMULATOR.lock();
    let hierarchy = simulator.get_or_insert_with(CacheHierarchy::new);
    if let Err(err) = hierarchy.init_l2(optstr) {
        die(&err);
    }
}

/// Construct the L3. Fatal if the L2 is not built yet.
pub fn init_cache_l3(optstr: &str) {
    let mut simulator = SIMULATOR.lock();
    let hierarchy = simulator.get_or_insert_with(CacheHierarchy::new);
    if let Err(err) = hierarchy.init_l3(optstr) {
        die(&err);
    }
}

/// Install the callback that receives the outermost level's line-granular
/// miss stream: `(vaddr_line, paddr_line, linesz, is_store)`.
pub fn install_miss_callback<F>(callback: F)
where
    F: Fn(u64, u64, u64, bool) + Send + Sync + 'static,
{
    let mut simulator = SIMULATOR.lock();
    simulator.get_or_insert_with(CacheHierarchy::new).install_miss_callback(callback);
}

/// Start the simulation: register the L1 tracers, open the output file
/// (standard output when `None`), and enable miss tracing on the
/// outermost configured level.
pub fn init_cachesim(filename: Option<&Path>) {
    let mut simulator = SIMULATOR.lock();
    let hierarchy = simulator.get_or_insert_with(CacheHierarchy::new);
    if let Err(err) = hierarchy.activate_to(filename) {
        die(&err);
    }
    ENABLED.store(true, Ordering::Relaxed);
}

/// Build and start the whole hierarchy from a deserialized [`Config`].
pub fn init_cachesim_from_config(config: &Config) {
    let mut hierarchy = match CacheHierarchy::from_config(config) {
        Ok(hierarchy) => hierarchy,
        Err(err) => die(&err),
    };
    if let Err(err) = hierarchy.activate_to(config.trace_file.as_deref()) {
        die(&err);
    }
    *SIMULATOR.lock() = Some(hierarchy);
    ENABLED.store(true, Ordering::Relaxed);
}

/// Ingest a guest load.
pub fn cachesim_ld(vaddr: u64, paddr: u64, bytes: u64) {
    if !cachesim_enabled() {
        return;
    }
    if let Some(hierarchy) = &*SIMULATOR.lock() {
        hierarchy.ld(vaddr, paddr, bytes);
    }
}

/// Ingest a guest store.
pub fn cachesim_st(vaddr: u64, paddr: u64, bytes: u64) {
    if !cachesim_enabled() {
        return;
    }
    if let Some(hierarchy) = &*SIMULATOR.lock() {
        hierarchy.st(vaddr, paddr, bytes);
    }
}

/// Ingest a guest instruction fetch.
pub fn cachesim_fc(vaddr: u64, paddr: u64, bytes: u64) {
    if !cachesim_enabled() {
        return;
    }
    if let Some(hierarchy) = &*SIMULATOR.lock() {
        hierarchy.fc(vaddr, paddr, bytes);
    }
}

/// Tear down the hierarchy, emitting per-level statistics (L1I, L1D, L2,
/// L3) to the sink chosen at [`init_cachesim`].
pub fn cachesim_destroy() {
    ENABLED.store(false, Ordering::Relaxed);
    let hierarchy = SIMULATOR.lock().take();
    if let Some(hierarchy) = hierarchy {
        if let Err(err) = hierarchy.finish() {
            error!("failed to emit cache statistics: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    // The front door is process-global, so the whole lifecycle lives in
    // one test.
    #[test]
    fn test_front_door_lifecycle() {
        assert!(!cachesim_enabled());

        init_cache_l1("4:2:64");
        init_cache_l2("64:8:64");
        init_cachesim(None);
        assert!(cachesim_enabled());

        cachesim_ld(0, 0x100, 4);
        cachesim_st(0, 0x104, 4);
        cachesim_fc(0, 0x2000, 4);

        {
            let simulator = SIMULATOR.lock();
            let hierarchy = simulator.as_ref().unwrap();
            let l1d = hierarchy.l1d().unwrap().stats();
            assert_eq!(l1d.read_accesses.load(Ordering::Relaxed), 1);
            assert_eq!(l1d.write_accesses.load(Ordering::Relaxed), 1);
            assert_eq!(hierarchy.l1i().unwrap().stats().read_accesses.load(Ordering::Relaxed), 1);
            assert_eq!(hierarchy.l2().unwrap().stats().read_accesses.load(Ordering::Relaxed), 2);
        }

        cachesim_destroy();
        assert!(!cachesim_enabled());

        // Dropped once the pipeline is down.
        cachesim_ld(0, 0x100, 4);
        assert!(SIMULATOR.lock().is_none());
    }
}
