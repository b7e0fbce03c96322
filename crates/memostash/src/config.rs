use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Controls where cache trees live and how the worker pool behaves.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory under which each wrapped function gets its own
    /// sharded cache tree. Created on first use.
    pub cache_dir: PathBuf,

    /// Whether the module path stays part of the on-disk directory name.
    ///
    /// Disabling this yields shorter paths during development, at the cost
    /// of requiring globally distinctive function and type names.
    pub include_module_path: bool,

    /// How long a worker blocks on the queue before re-checking the stop
    /// flag. Bounds how long `join` waits for an idle worker.
    #[serde(with = "humantime_serde")]
    pub worker_poll: Duration,

    /// Default interval at which `wait` emits a status line.
    #[serde(with = "humantime_serde")]
    pub status_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: PathBuf::from(".cache"),
            include_module_path: true,
            worker_poll: Duration::from_millis(100),
            status_interval: Duration::from_secs(2),
        }
    }
}

/// Sizing specification for the worker pool.
///
/// Accepted forms mirror the configuration surface: an absolute count, the
/// string `"all"`, a fraction in `(0, 1]` of the available execution
/// units, or a negative integer leaving that many units unused.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PoolSize {
    /// Explicit number of workers. Must be positive and must not exceed
    /// the available execution units.
    Fixed(usize),
    /// One worker per available execution unit.
    All,
    /// A fraction in `(0, 1]` of the available units, floored, at least one.
    Fraction(f64),
    /// All available units except this many.
    AllBut(usize),
}

impl Default for PoolSize {
    fn default() -> Self {
        PoolSize::All
    }
}

impl PoolSize {
    /// Resolves this specification against `available` execution units.
    ///
    /// Invalid specifications fail with [`Error::Config`]; this is checked
    /// when the pool starts, not when the value is parsed.
    pub fn resolve(self, available: usize) -> Result<usize> {
        match self {
            PoolSize::Fixed(0) => Err(Error::Config("worker count must be positive".into())),
            PoolSize::Fixed(n) if n > available => Err(Error::Config(format!(
                "worker count {n} exceeds the {available} available execution units"
            ))),
            PoolSize::Fixed(n) => Ok(n),
            PoolSize::All => Ok(available),
            PoolSize::Fraction(f) if f > 0.0 && f <= 1.0 => {
                Ok(((f * available as f64) as usize).max(1))
            }
            PoolSize::Fraction(f) => Err(Error::Config(format!(
                "worker fraction {f} is out of range (0, 1]"
            ))),
            PoolSize::AllBut(n) if n < available => Ok(available - n),
            PoolSize::AllBut(n) => Err(Error::Config(format!(
                "cannot leave {n} of {available} execution units unused"
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for PoolSize {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PoolSizeVisitor;

        impl<'de> Visitor<'de> for PoolSizeVisitor {
            type Value = PoolSize;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str(
                    "a worker count, a fraction in (0, 1], a negative offset, or \"all\"",
                )
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<PoolSize, E> {
                Ok(PoolSize::Fixed(value as usize))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<PoolSize, E> {
                if value >= 0 {
                    Ok(PoolSize::Fixed(value as usize))
                } else {
                    Ok(PoolSize::AllBut(value.unsigned_abs() as usize))
                }
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> std::result::Result<PoolSize, E> {
                Ok(PoolSize::Fraction(value))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<PoolSize, E> {
                if value.eq_ignore_ascii_case("all") {
                    Ok(PoolSize::All)
                } else {
                    Err(de::Error::invalid_value(de::Unexpected::Str(value), &self))
                }
            }
        }

        deserializer.deserialize_any(PoolSizeVisitor)
    }
}
