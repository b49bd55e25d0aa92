use super::*;
use std::collections::HashMap;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn defaults_are_valid() {
    let cfg = StoreConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.merge_policy, MergePolicy::All);
    assert_eq!(cfg.min_files_to_merge, 2);
    assert!(cfg.sync_on_finish);
}

#[test]
fn empty_environment_gives_defaults() {
    let cfg = StoreConfig::from_lookup(|_| None).unwrap();
    assert_eq!(cfg, StoreConfig::default());
}

#[test]
fn environment_overrides_are_applied() {
    let cfg = StoreConfig::from_lookup(lookup_from(&[
        ("LEDGERSTORE_MAX_FILE_MB", "4"),
        ("LEDGERSTORE_MERGE_POLICY", "oldest:3"),
        ("LEDGERSTORE_MOVE_BATCH", "10"),
        ("LEDGERSTORE_SYNC", "false"),
    ]))
    .unwrap();
    assert_eq!(cfg.max_data_file_bytes, 4 * 1024 * 1024);
    assert_eq!(cfg.merge_policy, MergePolicy::OldestFiles(3));
    assert_eq!(cfg.move_batch_size, 10);
    assert!(!cfg.sync_on_finish);
}

#[test]
fn unparsable_value_is_reported() {
    let err = StoreConfig::from_lookup(lookup_from(&[("LEDGERSTORE_READ_RETRIES", "many")]))
        .unwrap_err();
    assert_eq!(
        err,
        ConfigError::InvalidValue {
            name: "read_retries",
            value: "many".to_string()
        }
    );
}

#[test]
fn merge_policy_parsing() {
    assert_eq!("all".parse::<MergePolicy>().unwrap(), MergePolicy::All);
    assert_eq!(" ALL ".parse::<MergePolicy>().unwrap(), MergePolicy::All);
    assert_eq!(
        "oldest:5".parse::<MergePolicy>().unwrap(),
        MergePolicy::OldestFiles(5)
    );
    assert_eq!(
        "smaller:2".parse::<MergePolicy>().unwrap(),
        MergePolicy::FilesSmallerThan(2 * 1024 * 1024)
    );
    assert!("newest:1".parse::<MergePolicy>().is_err());
    assert!("oldest".parse::<MergePolicy>().is_err());
}

#[test]
fn zero_knobs_are_rejected() {
    let mut cfg = StoreConfig::default();
    cfg.move_batch_size = 0;
    assert_eq!(cfg.validate(), Err(ConfigError::Zero("move_batch_size")));

    let cfg = StoreConfig::default().with_merge_policy(MergePolicy::OldestFiles(0));
    assert!(cfg.validate().is_err());
}

#[test]
fn oversized_file_limits_are_rejected() {
    let err = StoreConfig::from_lookup(lookup_from(&[(
        "LEDGERSTORE_MAX_FILE_MB",
        "18446744073709551615",
    )]))
    .unwrap_err();
    assert_eq!(
        err,
        ConfigError::InvalidValue {
            name: "max_file_mb",
            value: "18446744073709551615".to_string()
        }
    );

    // 1 TiB + 1 MiB fits in a u64 but not in a location offset.
    let err = StoreConfig::from_lookup(lookup_from(&[("LEDGERSTORE_MAX_FILE_MB", "1048577")]))
        .unwrap_err();
    assert!(matches!(err, ConfigError::TooLarge { name: "max_data_file_bytes", .. }));

    let cfg = StoreConfig::from_lookup(lookup_from(&[("LEDGERSTORE_MAX_FILE_MB", "1048576")]))
        .unwrap();
    assert_eq!(cfg.max_data_file_bytes, MAX_DATA_FILE_BYTES);

    let mut cfg = StoreConfig::default();
    cfg.max_data_file_bytes = MAX_DATA_FILE_BYTES + 1;
    assert!(cfg.validate().is_err());

    assert!("smaller:18446744073709551615".parse::<MergePolicy>().is_err());
    assert_eq!(
        "smaller:1048576".parse::<MergePolicy>().unwrap(),
        MergePolicy::FilesSmallerThan(MAX_DATA_FILE_BYTES)
    );
}
