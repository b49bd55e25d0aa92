use crate::*;
use anyhow::Result;
use config::StoreConfig;
use longlist::LongList;
use std::fs;
use std::path::Path;

pub fn test_config() -> StoreConfig {
    StoreConfig {
        sync_on_finish: false,
        ..StoreConfig::default()
    }
}

pub fn open_fixed(dir: &Path, value_size: u32) -> Result<DataFileCollection> {
    DataFileCollection::open(dir, "test", RecordLayout::fixed(value_size), test_config())
}

pub fn open_variable(dir: &Path) -> Result<DataFileCollection> {
    DataFileCollection::open(dir, "test", RecordLayout::variable(), test_config())
}

pub fn value_for(key: u64, version: u64) -> Vec<u8> {
    format!("{:08}-{:04}", key, version).into_bytes()
}

/// Runs one session writing `keys` with `version`, recording locations in `index`.
pub fn write_session(
    coll: &DataFileCollection,
    index: &LongList,
    keys: impl IntoIterator<Item = u64>,
    version: u64,
    range: (u64, u64),
) -> Result<()> {
    coll.start_writing()?;
    for key in keys {
        let loc = coll.store_data(key, &[], &value_for(key, version))?;
        index.put(key, loc.raw())?;
    }
    coll.end_writing(range.0, range.1)?;
    Ok(())
}

pub fn count_dfl_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|ext| ext == "dfl")
                .unwrap_or(false)
        })
        .count()
}

/// Routes `tracing` output to the test harness; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
