use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Diagnostic printed alongside a rejected configuration string.
pub const USAGE: &str = "Cache configurations must be of the form
  sets:ways:blocksize
where sets, ways, and blocksize are positive integers, with
sets and blocksize both powers of two and blocksize at least 8.";

/// Geometry of a single cache level, already validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub sets: usize,
    pub ways: usize,
    /// Line size in bytes, a power of two no smaller than 8.
    pub linesz: u64,
}

impl CacheConfig {
    /// Shift that converts a byte address into a line number.
    pub fn idx_shift(&self) -> u32 {
        self.linesz.trailing_zeros()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The string is not of the form `sets:ways:linesz` with three
    /// decimal integers.
    Malformed(String),
    BadSets(usize),
    BadWays(usize),
    BadLineSize(u64),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Malformed(optstr) => {
                write!(f, "malformed cache configuration `{}`", optstr)
            }
            ConfigError::BadSets(sets) => {
                write!(f, "sets must be a power of two, got {}", sets)
            }
            ConfigError::BadWays(ways) => {
                write!(f, "ways must be at least 1, got {}", ways)
            }
            ConfigError::BadLineSize(linesz) => {
                write!(f, "line size must be a power of two of at least 8 bytes, got {}", linesz)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parse a `sets:ways:linesz` configuration string.
pub fn parse_config(optstr: &str) -> Result<CacheConfig, ConfigError> {
    let malformed = || ConfigError::Malformed(optstr.to_owned());

    let mut fields = optstr.splitn(3, ':');
    let (sets, ways, linesz) = match (fields.next(), fields.next(), fields.next()) {
        (Some(sets), Some(ways), Some(linesz)) => (sets, ways, linesz),
        _ => return Err(malformed()),
    };

    let sets: usize = sets.trim().parse().map_err(|_| malformed())?;
    let ways: usize = ways.trim().parse().map_err(|_| malformed())?;
    let linesz: u64 = linesz.trim().parse().map_err(|_| malformed())?;

    if !sets.is_power_of_two() {
        return Err(ConfigError::BadSets(sets));
    }
    if ways == 0 {
        return Err(ConfigError::BadWays(ways));
    }
    if linesz < 8 || !linesz.is_power_of_two() {
        return Err(ConfigError::BadLineSize(linesz));
    }

    Ok(CacheConfig { sets, ways, linesz })
}

/// Host-facing description of a whole hierarchy, usually deserialized from
/// the emulator's configuration file.
#[derive(Serialize, Deserialize, Debug)]
pub struct Config {
    /// L1 configuration, applied to both the instruction and the data cache.
    pub l1: String,

    /// Optional unified L2.
    #[serde(default)]
    pub l2: Option<String>,

    /// Optional L3. Requires an L2.
    #[serde(default)]
    pub l3: Option<String>,

    /// Where the miss banner and teardown statistics go.
    /// Standard output when absent.
    #[serde(default)]
    pub trace_file: Option<PathBuf>,
}
