//! The `<name>.hdhm` header file.
//!
//! ```text
//! [magic: u32 "HDHM"][version: u32][key_size: u32][entries_per_bucket: u32]
//! [num_buckets: u64][directory_capacity: u64][next_overflow_id: u64]
//! [directory_watermark: u32][crc32: u32]
//! ```
//!
//! `directory_watermark` is the first data file id whose buckets are not
//! reflected in the saved `<name>_buckets.ll`.

use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Magic number of the header file (ASCII "HDHM").
pub const HEADER_MAGIC: u32 = 0x4844_484D;

const HEADER_VERSION: u32 = 1;
const HEADER_BYTES: usize = 4 + 4 + 4 + 4 + 8 + 8 + 8 + 4 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MapHeader {
    pub key_size: u32,
    pub entries_per_bucket: u32,
    pub num_buckets: u64,
    pub directory_capacity: u64,
    pub next_overflow_id: u64,
    pub directory_watermark: u32,
}

impl MapHeader {
    pub fn path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{}.hdhm", name))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read header {}", path.display()))?;
        if bytes.len() != HEADER_BYTES {
            bail!("header {} has {} bytes, expected {}", path.display(), bytes.len(), HEADER_BYTES);
        }
        let (body, crc) = bytes.split_at(HEADER_BYTES - 4);
        if crc32fast::hash(body) != LittleEndian::read_u32(crc) {
            bail!("header {} failed its checksum", path.display());
        }
        let magic = LittleEndian::read_u32(&body[0..4]);
        if magic != HEADER_MAGIC {
            bail!("header {} has bad magic {:#010x}", path.display(), magic);
        }
        let version = LittleEndian::read_u32(&body[4..8]);
        if version != HEADER_VERSION {
            bail!(
                "unsupported header version {} in {} (expected {})",
                version,
                path.display(),
                HEADER_VERSION
            );
        }
        Ok(Self {
            key_size: LittleEndian::read_u32(&body[8..12]),
            entries_per_bucket: LittleEndian::read_u32(&body[12..16]),
            num_buckets: LittleEndian::read_u64(&body[16..24]),
            directory_capacity: LittleEndian::read_u64(&body[24..32]),
            next_overflow_id: LittleEndian::read_u64(&body[32..40]),
            directory_watermark: LittleEndian::read_u32(&body[40..44]),
        })
    }

    /// Writes the header atomically (temp file, fsync, rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut buf = vec![0u8; HEADER_BYTES];
        LittleEndian::write_u32(&mut buf[0..4], HEADER_MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], HEADER_VERSION);
        LittleEndian::write_u32(&mut buf[8..12], self.key_size);
        LittleEndian::write_u32(&mut buf[12..16], self.entries_per_bucket);
        LittleEndian::write_u64(&mut buf[16..24], self.num_buckets);
        LittleEndian::write_u64(&mut buf[24..32], self.directory_capacity);
        LittleEndian::write_u64(&mut buf[32..40], self.next_overflow_id);
        LittleEndian::write_u32(&mut buf[40..44], self.directory_watermark);
        let crc = crc32fast::hash(&buf[..HEADER_BYTES - 4]);
        LittleEndian::write_u32(&mut buf[HEADER_BYTES - 4..], crc);

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .with_context(|| format!("failed to create header tmp {}", tmp.display()))?;
            f.write_all(&buf)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to move header into place at {}", path.display()))?;
        Ok(())
    }
}
