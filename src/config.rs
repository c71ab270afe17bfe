use std::num::NonZeroUsize;
use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variables with this prefix override file settings, e.g.
/// `CLOSEPAIRS_COUNTER_THREADS=4`.
pub const ENV_PREFIX: &str = "CLOSEPAIRS_";

/// Keys claimed per grab from the shared cursor.
pub const DEFAULT_STEAL_STRIDE: usize = 64;

/// Spatial index used to find candidate pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum IndexKind {
    /// Lock-free chunked hash table filled by all parser threads.
    #[default]
    Chunked,
    /// Dense grid of per-cell lists, filled by one thread.
    Grid,
    /// Unbalanced k-d tree, built and counted on one thread.
    KdTree,
}

/// Everything the pipeline needs besides its input. Cell size and threshold
/// are fixed in [`crate::cell`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CountConfig {
    pub parser_threads: usize,
    pub counter_threads: usize,
    pub steal_stride: usize,
    /// Expected number of distinct cells. Derived from the input size when
    /// unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_capacity: Option<usize>,
    pub index: IndexKind,
}

impl Default for CountConfig {
    fn default() -> Self {
        let threads = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        Self {
            parser_threads: threads,
            counter_threads: threads,
            steal_stride: DEFAULT_STEAL_STRIDE,
            table_capacity: None,
            index: IndexKind::default(),
        }
    }
}

/// Command-line settings, applied on top of every other source.
#[derive(Debug, Clone, Default, Serialize, clap::Args)]
pub struct ConfigOverrides {
    /// Number of parser threads.
    #[arg(short = 'p', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parser_threads: Option<usize>,
    /// Number of counter threads.
    #[arg(short = 'c', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter_threads: Option<usize>,
    /// Cell keys claimed per steal.
    #[arg(long = "stride")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steal_stride: Option<usize>,
    /// Expected number of occupied cells.
    #[arg(long = "capacity")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_capacity: Option<usize>,
    /// Spatial index to count with.
    #[arg(long, value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexKind>,
}

impl CountConfig {
    /// Layer defaults, the YAML file at `path` (if given), `CLOSEPAIRS_*`
    /// environment variables and `overrides`, in increasing priority.
    pub fn load(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let mut f = Figment::from(Serialized::defaults(CountConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::Io {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
                });
            }
            f = f.merge(Yaml::file(path));
        }
        let config: CountConfig = f
            .merge(Env::prefixed(ENV_PREFIX))
            .merge(Serialized::defaults(overrides))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parser_threads == 0 {
            return Err(Error::InvalidConfig("parser_threads must be at least 1".into()));
        }
        if self.counter_threads == 0 {
            return Err(Error::InvalidConfig("counter_threads must be at least 1".into()));
        }
        if self.steal_stride == 0 {
            return Err(Error::InvalidConfig("steal_stride must be at least 1".into()));
        }
        Ok(())
    }

    pub fn with_threads(mut self, parser_threads: usize, counter_threads: usize) -> Self {
        self.parser_threads = parser_threads;
        self.counter_threads = counter_threads;
        self
    }

    pub fn with_index(mut self, index: IndexKind) -> Self {
        self.index = index;
        self
    }
}
