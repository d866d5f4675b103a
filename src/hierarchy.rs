//! Construction and lifecycle of a complete cache hierarchy.

use crate::cache::{construct, Cache, MissTraceEmitter};
use crate::config::{parse_config, Config, ConfigError};
use crate::tracer::{AccessEvent, AccessType, DcacheTracer, IcacheTracer, TracerList};
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

/// Errors raised while building or activating a hierarchy.
#[derive(Debug)]
pub enum Error {
    Config(ConfigError),
    /// L2 requested without both L1 caches.
    MissingL1,
    /// L3 requested without an L2.
    MissingL2,
    /// The named level was constructed twice.
    AlreadyBuilt(&'static str),
    /// `activate` ran twice; tracers register only once.
    AlreadyActive,
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Config(err) => err.fmt(f),
            Error::MissingL1 => write!(f, "Cannot define L2 without L1 cache"),
            Error::MissingL2 => write!(f, "Cannot define L3 without L2 cache"),
            Error::AlreadyBuilt(level) => write!(f, "{} cache already defined", level),
            Error::AlreadyActive => write!(f, "cache simulation already activated"),
            Error::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(err) => Some(err),
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// A wired hierarchy: L1I and L1D behind their tracers, optionally an L2
/// and an L3 chained as miss handlers.
///
/// Levels are built innermost-first; connecting an outer level wires the
/// existing levels' miss handlers to it. Nothing flows until [`activate`]
/// has registered the tracers and chosen the output sink.
///
/// [`activate`]: CacheHierarchy::activate
pub struct CacheHierarchy {
    l1i: Option<Arc<IcacheTracer>>,
    l1d: Option<Arc<DcacheTracer>>,
    l2: Option<Arc<dyn Cache>>,
    l3: Option<Arc<dyn Cache>>,
    tracers: TracerList,
    emitter: Arc<MissTraceEmitter>,
    out: Option<Box<dyn Write + Send>>,
}

impl CacheHierarchy {
    pub fn new() -> Self {
        CacheHierarchy {
            l1i: None,
            l1d: None,
            l2: None,
            l3: None,
            tracers: TracerList::new(),
            emitter: Arc::new(MissTraceEmitter::new()),
            out: None,
        }
    }

    /// Build both L1 caches from one `sets:ways:linesz` string.
    pub fn init_l1(&mut self, optstr: &str) -> Result<(), Error> {
        if self.l1i.is_some() {
            return Err(Error::AlreadyBuilt("L1"));
        }
        let config = parse_config(optstr)?;
        self.l1i =
            Some(Arc::new(IcacheTracer::new(construct(&config, "I$", self.emitter.clone()))));
        self.l1d =
            Some(Arc::new(DcacheTracer::new(construct(&config, "D$", self.emitter.clone()))));
        info!("L1 caches configured as {}", optstr);
        Ok(())
    }

    /// Build the unified L2 and connect both L1 miss handlers to it.
    pub fn init_l2(&mut self, optstr: &str) -> Result<(), Error> {
        if self.l2.is_some() {
            return Err(Error::AlreadyBuilt("L2"));
        }
        let (l1i, l1d) = match (&self.l1i, &self.l1d) {
            (Some(l1i), Some(l1d)) => (l1i, l1d),
            _ => return Err(Error::MissingL1),
        };
        let config = parse_config(optstr)?;
        let l2 = construct(&config, "L2$", self.emitter.clone());
        l1i.set_miss_handler(l2.clone());
        l1d.set_miss_handler(l2.clone());
        self.l2 = Some(l2);
        info!("L2 cache configured as {}", optstr);
        Ok(())
    }

    /// Build the L3 and connect the L2 miss handler to it.
    pub fn init_l3(&mut self, optstr: &str) -> Result<(), Error> {
        if self.l3.is_some() {
            return Err(Error::AlreadyBuilt("L3"));
        }
        let l2 = self.l2.as_ref().ok_or(Error::MissingL2)?;
        let config = parse_config(optstr)?;
        let l3 = construct(&config, "L3$", self.emitter.clone());
        l2.set_miss_handler(l3.clone());
        self.l3 = Some(l3);
        info!("L3 cache configured as {}", optstr);
        Ok(())
    }

    /// Build a hierarchy, not yet activated, from a deserialized
    /// [`Config`].
    pub fn from_config(config: &Config) -> Result<CacheHierarchy, Error> {
        let mut hierarchy = CacheHierarchy::new();
        hierarchy.init_l1(&config.l1)?;
        if let Some(l2) = &config.l2 {
            hierarchy.init_l2(l2)?;
        }
        if let Some(l3) = &config.l3 {
            hierarchy.init_l3(l3)?;
        }
        Ok(hierarchy)
    }

    /// Install the callback that receives the outermost level's miss
    /// stream once tracing is enabled.
    pub fn install_miss_callback<F>(&self, callback: F)
    where
        F: Fn(u64, u64, u64, bool) + Send + Sync + 'static,
    {
        self.emitter.install(callback);
    }

    /// Register the tracers (L1I first, then L1D), pick the output sink,
    /// and enable miss tracing on the outermost configured level.
    pub fn activate(&mut self, mut out: Box<dyn Write + Send>) -> Result<(), Error> {
        if self.out.is_some() {
            return Err(Error::AlreadyActive);
        }
        let l1i = self.l1i.clone().ok_or(Error::MissingL1)?;
        let l1d = self.l1d.clone().ok_or(Error::MissingL1)?;
        self.tracers.hook(l1i.clone());
        self.tracers.hook(l1d.clone());

        if let Some(l3) = &self.l3 {
            writeln!(out, "L3 misses will be traced")?;
            l3.enable_trace_miss();
        } else if let Some(l2) = &self.l2 {
            writeln!(out, "L2 misses will be traced")?;
            l2.enable_trace_miss();
        } else {
            writeln!(out, "L1 misses will be traced")?;
            l1i.enable_trace_miss();
            l1d.enable_trace_miss();
        }
        info!("cache simulation activated");

        self.out = Some(out);
        Ok(())
    }

    /// [`activate`](CacheHierarchy::activate) with the sink opened from a
    /// path, or standard output when none is given.
    pub fn activate_to(&mut self, path: Option<&Path>) -> Result<(), Error> {
        let out: Box<dyn Write + Send> = match path {
            Some(path) => Box::new(File::create(path)?),
            None => Box::new(io::stdout()),
        };
        self.activate(out)
    }

    /// Fan one event out to every registered tracer.
    pub fn trace(&self, event: &AccessEvent) {
        self.tracers.trace(event);
    }

    pub fn ld(&self, vaddr: u64, paddr: u64, bytes: u64) {
        self.trace(&AccessEvent { vaddr, paddr, bytes, kind: AccessType::Load });
    }

    pub fn st(&self, vaddr: u64, paddr: u64, bytes: u64) {
        self.trace(&AccessEvent { vaddr, paddr, bytes, kind: AccessType::Store });
    }

    pub fn fc(&self, vaddr: u64, paddr: u64, bytes: u64) {
        self.trace(&AccessEvent { vaddr, paddr, bytes, kind: AccessType::Fetch });
    }

    pub fn l1i(&self) -> Option<&Arc<dyn Cache>> {
        self.l1i.as_ref().map(|tracer| tracer.cache())
    }

    pub fn l1d(&self) -> Option<&Arc<dyn Cache>> {
        self.l1d.as_ref().map(|tracer| tracer.cache())
    }

    pub fn l2(&self) -> Option<&Arc<dyn Cache>> {
        self.l2.as_ref()
    }

    pub fn l3(&self) -> Option<&Arc<dyn Cache>> {
        self.l3.as_ref()
    }

    /// Tear the hierarchy down, emitting per-level statistics in
    /// construction order: L1I, L1D, L2, L3. Falls back to standard
    /// output if the hierarchy was never activated.
    pub fn finish(mut self) -> io::Result<()> {
        let mut out: Box<dyn Write + Send> = match self.out.take() {
            Some(out) => out,
            None => Box::new(io::stdout()),
        };
        if let Some(l1i) = &self.l1i {
            l1i.cache().print_stats(&mut *out)?;
        }
        if let Some(l1d) = &self.l1d {
            l1d.cache().print_stats(&mut *out)?;
        }
        if let Some(l2) = &self.l2 {
            l2.print_stats(&mut *out)?;
        }
        if let Some(l3) = &self.l3 {
            l3.print_stats(&mut *out)?;
        }
        out.flush()
    }
}

impl Default for CacheHierarchy {
    fn default() -> Self {
        CacheHierarchy::new()
    }
}
