//! Access-type demultiplexing between the host's trace stream and the L1
//! caches.

use crate::cache::Cache;
use std::sync::Arc;

/// Kind of guest memory operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessType {
    Load,
    Store,
    Fetch,
}

/// One traced guest access. `vaddr` is zero when the host has no virtual
/// address for the operation; `bytes` is the raw access width, not the
/// line size.
#[derive(Clone, Copy, Debug)]
pub struct AccessEvent {
    pub vaddr: u64,
    pub paddr: u64,
    pub bytes: u64,
    pub kind: AccessType,
}

/// Consumer of traced accesses.
pub trait MemTracer: Send + Sync {
    /// Whether accesses of `kind` within `[begin, end)` concern this
    /// tracer.
    fn interested_in_range(&self, begin: u64, end: u64, kind: AccessType) -> bool;

    fn trace(&self, event: &AccessEvent);
}

/// Instruction-side tracer, feeding FETCH events to its cache.
pub struct IcacheTracer {
    cache: Arc<dyn Cache>,
}

impl IcacheTracer {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        IcacheTracer { cache }
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub fn set_miss_handler(&self, next: Arc<dyn Cache>) {
        self.cache.set_miss_handler(next);
    }

    pub fn enable_trace_miss(&self) {
        self.cache.enable_trace_miss();
    }
}

impl MemTracer for IcacheTracer {
    fn interested_in_range(&self, _begin: u64, _end: u64, kind: AccessType) -> bool {
        kind == AccessType::Fetch
    }

    fn trace(&self, event: &AccessEvent) {
        if event.kind == AccessType::Fetch {
            self.cache.access(event.vaddr, event.paddr, event.bytes, false);
        }
    }
}

/// Data-side tracer, feeding LOAD and STORE events to its cache.
pub struct DcacheTracer {
    cache: Arc<dyn Cache>,
}

impl DcacheTracer {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        DcacheTracer { cache }
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub fn set_miss_handler(&self, next: Arc<dyn Cache>) {
        self.cache.set_miss_handler(next);
    }

    pub fn enable_trace_miss(&self) {
        self.cache.enable_trace_miss();
    }
}

impl MemTracer for DcacheTracer {
    fn interested_in_range(&self, _begin: u64, _end: u64, kind: AccessType) -> bool {
        kind == AccessType::Load || kind == AccessType::Store
    }

    fn trace(&self, event: &AccessEvent) {
        match event.kind {
            AccessType::Load => self.cache.access(event.vaddr, event.paddr, event.bytes, false),
            AccessType::Store => self.cache.access(event.vaddr, event.paddr, event.bytes, true),
            AccessType::Fetch => {}
        }
    }
}

/// Insertion-ordered fan-out of traced accesses to every hooked tracer.
pub struct TracerList {
    tracers: Vec<Arc<dyn MemTracer>>,
}

impl TracerList {
    pub fn new() -> Self {
        TracerList { tracers: Vec::new() }
    }

    pub fn hook(&mut self, tracer: Arc<dyn MemTracer>) {
        self.tracers.push(tracer);
    }

    pub fn trace(&self, event: &AccessEvent) {
        for tracer in &self.tracers {
            if tracer.interested_in_range(event.paddr, event.paddr + event.bytes, event.kind) {
                tracer.trace(event);
            }
        }
    }
}

impl Default for TracerList {
    fn default() -> Self {
        TracerList::new()
    }
}
