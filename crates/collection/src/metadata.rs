//! # Metadata - persistent collection state
//!
//! One small text file per store, `<store>_metadata.dfc`, holding the
//! format version and the valid key range of the last write session:
//!
//! ```text
//! # ledger store collection metadata
//! version=1
//! min_valid_key=0
//! max_valid_key=999
//! ```
//!
//! Lines starting with `#` are comments. The file is rewritten atomically:
//! temp file, fsync, rename.

use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Extension of the metadata file.
pub const METADATA_EXTENSION: &str = "dfc";

const METADATA_VERSION: u32 = 1;

/// Persistent state of a collection that does not live in file footers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMetadata {
    pub version: u32,
    /// Smallest key considered live; records below are dropped by merges.
    pub min_valid_key: u64,
    /// Largest key considered live; records above are dropped by merges.
    pub max_valid_key: u64,
}

impl Default for CollectionMetadata {
    fn default() -> Self {
        Self {
            version: METADATA_VERSION,
            min_valid_key: 0,
            max_valid_key: u64::MAX,
        }
    }
}

impl CollectionMetadata {
    #[must_use]
    pub fn path(dir: &Path, store_name: &str) -> PathBuf {
        dir.join(format!("{}_metadata.{}", store_name, METADATA_EXTENSION))
    }

    /// Loads `<store>_metadata.dfc` from `dir`, or returns the defaults
    /// (full key range) if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed or has an
    /// unsupported version.
    pub fn load_or_create(dir: &Path, store_name: &str) -> Result<Self> {
        let path = Self::path(dir, store_name);
        if !path.exists() {
            return Ok(Self::default());
        }
        let file = File::open(&path)
            .with_context(|| format!("failed to open metadata at {}", path.display()))?;
        let mut meta = Self::default();
        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line =
                line.with_context(|| format!("failed to read metadata line {}", line_num + 1))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let (name, value) = trimmed.split_once('=').ok_or_else(|| {
                anyhow::anyhow!(
                    "metadata line {}: invalid format (expected 'name=value'): {}",
                    line_num + 1,
                    trimmed
                )
            })?;
            let parse = || {
                value.trim().parse::<u64>().with_context(|| {
                    format!("metadata line {}: bad number '{}'", line_num + 1, value)
                })
            };
            match name.trim() {
                "version" => meta.version = parse()? as u32,
                "min_valid_key" => meta.min_valid_key = parse()?,
                "max_valid_key" => meta.max_valid_key = parse()?,
                other => bail!("metadata line {}: unknown field '{}'", line_num + 1, other),
            }
        }
        if meta.version != METADATA_VERSION {
            bail!(
                "unsupported metadata version {} in {} (expected {})",
                meta.version,
                path.display(),
                METADATA_VERSION
            );
        }
        if meta.min_valid_key > meta.max_valid_key {
            bail!(
                "metadata {} has an empty key range {}..={}",
                path.display(),
                meta.min_valid_key,
                meta.max_valid_key
            );
        }
        Ok(meta)
    }

    /// Writes the metadata for `store_name` into `dir`.
    ///
    /// Uses write-to-temp + fsync + rename. If the rename fails (Windows can
    /// refuse to replace a cached file) the target is rewritten in place.
    pub fn save_to(&self, dir: &Path, store_name: &str) -> Result<()> {
        let path = Self::path(dir, store_name);
        let tmp_path = path.with_extension(format!("{}.tmp", METADATA_EXTENSION));
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .with_context(|| format!("failed to create metadata tmp at {}", tmp_path.display()))?;
            self.write_contents(&mut f)?;
            f.sync_all()?;
        }

        if fs::rename(&tmp_path, &path).is_err() {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .with_context(|| format!("failed to open metadata at {}", path.display()))?;
            self.write_contents(&mut f)?;
            f.sync_all()?;
            let _ = fs::remove_file(&tmp_path);
        }
        Ok(())
    }

    fn write_contents(&self, f: &mut File) -> Result<()> {
        writeln!(f, "# ledger store collection metadata")?;
        writeln!(f, "version={}", self.version)?;
        writeln!(f, "min_valid_key={}", self.min_valid_key)?;
        writeln!(f, "max_valid_key={}", self.max_valid_key)?;
        f.flush()?;
        Ok(())
    }
}
