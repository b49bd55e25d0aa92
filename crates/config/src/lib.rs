//! # Config - store tuning knobs
//!
//! Every storage component (data file collection, disk hash map, indexed
//! store) takes a [`StoreConfig`]. Defaults are suitable for production;
//! tests shrink them to exercise roll-over and overflow paths.
//!
//! ## Environment variables
//!
//! ```text
//! LEDGERSTORE_MAX_FILE_MB     max merge output file size in MiB   (default: 1024)
//! LEDGERSTORE_MERGE_POLICY    all | oldest:<n> | smaller:<mb>     (default: all)
//! LEDGERSTORE_MIN_MERGE_FILES minimum files for a merge to run    (default: 2)
//! LEDGERSTORE_MOVE_BATCH      relocation pairs per callback batch (default: 500000)
//! LEDGERSTORE_READ_RETRIES    retries for reads racing a merge    (default: 5)
//! LEDGERSTORE_MAX_OVERFLOW    overflow buckets per hash chain     (default: 64)
//! LEDGERSTORE_SYNC            fsync files when sealing them       (default: true)
//! ```

use std::str::FromStr;

use thiserror::Error;

const MIB: u64 = 1024 * 1024;

/// Largest `max_data_file_bytes` allowed: locations carry a 40-bit offset.
pub const MAX_DATA_FILE_BYTES: u64 = 1 << 40;
/// Default maximum size of a single merge output file (1 GiB).
pub const DEFAULT_MAX_DATA_FILE_BYTES: u64 = 1024 * MIB;
/// Default number of `(old, new)` location pairs handed to the relocation
/// callback in one batch.
pub const DEFAULT_MOVE_BATCH_SIZE: usize = 500_000;
/// Default number of retries for index based reads that race a merge.
pub const DEFAULT_READ_RETRIES: usize = 5;
/// Default maximum length of a bucket overflow chain.
pub const DEFAULT_MAX_OVERFLOW_BUCKETS: usize = 64;

/// Errors produced while parsing or validating a [`StoreConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{name} is {value}, the limit is {max}")]
    TooLarge { name: &'static str, value: u64, max: u64 },
}

/// Selects which sealed files take part in a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Merge every sealed file.
    #[default]
    All,
    /// Merge the `n` oldest sealed files (lowest file ids).
    OldestFiles(usize),
    /// Merge every sealed file smaller than the given size in bytes.
    FilesSmallerThan(u64),
}

impl FromStr for MergePolicy {
    type Err = ConfigError;

    /// Parses `all`, `oldest:<n>` or `smaller:<mb>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidValue {
            name: "merge_policy",
            value: s.to_string(),
        };
        let trimmed = s.trim().to_ascii_lowercase();
        if trimmed == "all" {
            return Ok(MergePolicy::All);
        }
        let (kind, arg) = trimmed.split_once(':').ok_or_else(invalid)?;
        let n: u64 = arg.parse().map_err(|_| invalid())?;
        match kind {
            "oldest" => usize::try_from(n).map(MergePolicy::OldestFiles).map_err(|_| invalid()),
            "smaller" => n
                .checked_mul(MIB)
                .map(MergePolicy::FilesSmallerThan)
                .ok_or_else(invalid),
            _ => Err(invalid()),
        }
    }
}

/// Tuning for a data file collection and the structures built on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Merge output rolls over to a new file once it reaches this size.
    pub max_data_file_bytes: u64,
    /// Which files a merge consolidates.
    pub merge_policy: MergePolicy,
    /// A merge selecting fewer files than this does nothing.
    pub min_files_to_merge: usize,
    /// Maximum number of relocations passed to the callback at once.
    pub move_batch_size: usize,
    /// How often an index based read is retried when a merge removed the
    /// file between the index lookup and the read.
    pub read_retries: usize,
    /// Maximum number of overflow buckets chained behind one hash bucket.
    pub max_overflow_buckets: usize,
    /// If `true`, data files are fsynced when they are sealed.
    pub sync_on_finish: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_data_file_bytes: DEFAULT_MAX_DATA_FILE_BYTES,
            merge_policy: MergePolicy::All,
            min_files_to_merge: 2,
            move_batch_size: DEFAULT_MOVE_BATCH_SIZE,
            read_retries: DEFAULT_READ_RETRIES,
            max_overflow_buckets: DEFAULT_MAX_OVERFLOW_BUCKETS,
            sync_on_finish: true,
        }
    }
}

impl StoreConfig {
    /// Builds a config from `LEDGERSTORE_*` environment variables, falling
    /// back to the defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a variable is set but cannot
    /// be parsed, or any error from [`validate`](StoreConfig::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](StoreConfig::from_env) with a custom variable
    /// source, so tests do not have to mutate the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let max_data_file_bytes = match parse_or::<_, u64>(&lookup, "LEDGERSTORE_MAX_FILE_MB", "max_file_mb")? {
            Some(mb) => mb.checked_mul(MIB).ok_or_else(|| ConfigError::InvalidValue {
                name: "max_file_mb",
                value: mb.to_string(),
            })?,
            None => defaults.max_data_file_bytes,
        };
        let cfg = Self {
            max_data_file_bytes,
            merge_policy: parse_or(&lookup, "LEDGERSTORE_MERGE_POLICY", "merge_policy")?
                .unwrap_or(defaults.merge_policy),
            min_files_to_merge: parse_or(&lookup, "LEDGERSTORE_MIN_MERGE_FILES", "min_merge_files")?
                .unwrap_or(defaults.min_files_to_merge),
            move_batch_size: parse_or(&lookup, "LEDGERSTORE_MOVE_BATCH", "move_batch")?
                .unwrap_or(defaults.move_batch_size),
            read_retries: parse_or(&lookup, "LEDGERSTORE_READ_RETRIES", "read_retries")?
                .unwrap_or(defaults.read_retries),
            max_overflow_buckets: parse_or(&lookup, "LEDGERSTORE_MAX_OVERFLOW", "max_overflow")?
                .unwrap_or(defaults.max_overflow_buckets),
            sync_on_finish: parse_or(&lookup, "LEDGERSTORE_SYNC", "sync")?
                .unwrap_or(defaults.sync_on_finish),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks that every knob has a usable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_data_file_bytes == 0 {
            return Err(ConfigError::Zero("max_data_file_bytes"));
        }
        if self.max_data_file_bytes > MAX_DATA_FILE_BYTES {
            return Err(ConfigError::TooLarge {
                name: "max_data_file_bytes",
                value: self.max_data_file_bytes,
                max: MAX_DATA_FILE_BYTES,
            });
        }
        if self.move_batch_size == 0 {
            return Err(ConfigError::Zero("move_batch_size"));
        }
        if self.min_files_to_merge == 0 {
            return Err(ConfigError::Zero("min_files_to_merge"));
        }
        if let MergePolicy::OldestFiles(0) = self.merge_policy {
            return Err(ConfigError::Zero("merge_policy oldest file count"));
        }
        Ok(())
    }

    /// Returns a copy with a different merge policy.
    #[must_use]
    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
    }
}

#[cfg(test)]
mod tests;
