//! Online V1 to V2 migration: round trips, legacy peers, the fixed flag.

mod fixtures;

use std::time::Duration;

use serde_json::json;

use fixtures::{Log, TestDir, add_collector, entry, merged_view, path};

#[test]
fn v1_data_survives_upgrade_by_a_fresh_reader() {
    let fx = TestDir::new();
    fx.write_root_info("{\"version\": 1}");

    let mut writer = fx.open("dev1-writer");
    assert_eq!(writer.version(), 1);
    add_collector(&mut writer);
    writer
        .set_entries_for_path(
            &path(&["cats", "persian"]),
            &[
                entry("2024-05-01T10:00:00", "name", json!("Mittens")),
                entry("2024-05-01T10:00:01", "color", json!("grey")),
            ],
        )
        .unwrap();
    writer
        .set_entries_for_path(
            &path(&["dogs", "corgi"]),
            &[entry("2024-05-01T10:00:02", "name", json!("Rex"))],
        )
        .unwrap();
    drop(writer);

    // The fresh reader joins at V1 (the only version present), finds no
    // legacy peer, and upgrades during its first maintenance pass.
    let mut reader = fx.open("dev2-reader");
    assert_eq!(reader.version(), 1);
    add_collector(&mut reader);

    let mut log: Log = Vec::new();
    reader.execute_all_new_entries(&mut log).unwrap();
    assert_eq!(reader.version(), 2);
    assert_eq!(fx.read_root_info()["version"], json!(2));

    // The migrated log replays through the listeners.
    let values: Vec<String> = log.iter().map(|(_, e)| e.value.to_string()).collect();
    for expected in ["\"Mittens\"", "\"grey\"", "\"Rex\""] {
        assert!(values.iter().any(|v| v == expected), "{values:?}");
    }

    // And the merged view is exactly what V1 held.
    assert_eq!(
        merged_view(&mut reader, &path(&[])),
        vec![
            (path(&["cats", "persian"]), "\"color\"".into(), "\"grey\"".into()),
            (path(&["cats", "persian"]), "\"name\"".into(), "\"Mittens\"".into()),
            (path(&["dogs", "corgi"]), "\"name\"".into(), "\"Rex\"".into()),
        ]
    );

    // V2 is now the single latest version for queries.
    assert_eq!(
        decsync::get_entries_count(fx.decsync_dir(), "contacts", None, &path(&["cats"])).unwrap(),
        2
    );
    assert_eq!(
        decsync::get_entries_count(fx.decsync_dir(), "contacts", None, &path(&["dogs"])).unwrap(),
        1
    );
}

#[test]
fn upgraded_reader_reopens_at_v2() {
    let fx = TestDir::new();
    fx.write_root_info("{\"version\": 1}");

    let mut reader = fx.open("dev2-reader");
    add_collector(&mut reader);
    let mut log: Log = Vec::new();
    reader.execute_all_new_entries(&mut log).unwrap();
    assert_eq!(reader.version(), 2);
    drop(reader);

    let reader = fx.open("dev2-reader");
    assert_eq!(reader.version(), 2, "local info remembers the upgrade");
}

#[test]
fn active_legacy_peer_blocks_the_upgrade() {
    let fx = TestDir::new();
    fx.write_root_info("{\"version\": 1}");

    let today = decsync::today();
    fx.write_v1_stored_entries(
        "dev1-legacy",
        &["info"],
        &[
            entry("2024-05-01T10:00:00", "last-active-dev1-legacy", json!(today.clone())),
            entry("2024-05-01T10:00:00", "supported-version-dev1-legacy", json!(1)),
        ],
    );
    fx.write_v1_new_entries(
        "dev1-legacy",
        &["cats"],
        &[entry("2024-05-01T10:00:01", "name", json!("Mittens"))],
    );

    let mut reader = fx.open("dev2-reader");
    add_collector(&mut reader);
    let mut log: Log = Vec::new();
    reader.execute_all_new_entries(&mut log).unwrap();

    assert_eq!(reader.version(), 1, "legacy peer pins the version");
    assert_eq!(fx.read_root_info()["version"], json!(1));
    assert!(log.iter().any(|(_, e)| e.value == json!("Mittens")), "{log:?}");

    // The legacy app catches up and declares V2 support; the next pass
    // migrates without losing its entries.
    fx.write_v1_stored_entries(
        "dev1-legacy",
        &["info"],
        &[
            entry("2024-05-01T10:00:00", "last-active-dev1-legacy", json!(today)),
            entry("2024-06-01T10:00:00", "supported-version-dev1-legacy", json!(2)),
        ],
    );

    reader.execute_all_new_entries(&mut log).unwrap();
    assert_eq!(reader.version(), 2);
    assert_eq!(fx.read_root_info()["version"], json!(2));
    assert_eq!(
        merged_view(&mut reader, &path(&["cats"])),
        vec![(path(&["cats"]), "\"name\"".into(), "\"Mittens\"".into())]
    );
}

#[test]
fn fixed_directories_never_auto_upgrade() {
    let fx = TestDir::new();
    fx.write_root_info("{\"version\": 1, \"fixed\": true}");

    let mut reader = fx.open("dev2-reader");
    add_collector(&mut reader);
    let mut log: Log = Vec::new();
    reader.execute_all_new_entries(&mut log).unwrap();
    reader.execute_all_new_entries(&mut log).unwrap();

    assert_eq!(reader.version(), 1);
    assert_eq!(fx.read_root_info()["version"], json!(1));
    assert_eq!(fx.read_root_info()["fixed"], json!(true));
}

#[test]
fn superseded_own_subtree_is_deleted_in_the_background() {
    let fx = TestDir::new();
    fx.write_root_info("{\"version\": 1}");

    let mut reader = fx.open("dev2-reader");
    add_collector(&mut reader);
    reader
        .set_entries_for_path(&path(&["cats"]), &[entry("2024-05-01T10:00:00", "name", json!("Mittens"))])
        .unwrap();

    let own_v1 = fx.sub().join("new-entries").join("dev2-reader");
    assert!(own_v1.is_dir());

    let mut log: Log = Vec::new();
    reader.execute_all_new_entries(&mut log).unwrap();
    assert_eq!(reader.version(), 2);

    // Deletion is fire-and-forget on a background thread; poll briefly.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while own_v1.exists() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!own_v1.exists(), "old own entries should be gone");

    assert_eq!(
        merged_view(&mut reader, &path(&["cats"])),
        vec![(path(&["cats"]), "\"name\"".into(), "\"Mittens\"".into())]
    );
}
