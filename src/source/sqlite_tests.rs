//! Tests for the SQLite data source.

use super::*;
use tempfile::TempDir;

fn source(dir: &TempDir, adjust: impl FnOnce(&mut SqliteConfig)) -> SqliteSource {
    let mut config = SqliteConfig {
        db_file: dir.path().join("state.db"),
        find_system_enabled: true,
        key_prefix: String::new(),
    };
    adjust(&mut config);
    SqliteSource::new(&config).unwrap()
}

fn store(dir: &TempDir) -> DataStore {
    DataStore::open(&dir.path().join("state.db")).unwrap()
}

#[test]
fn get_data_projects_flat_keys() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    store
        .set_value("sys", "netboot_enabled", &Value::Bool(true))
        .unwrap();
    let source = source(&dir, |_| {});

    let (data, _) = source
        .get_data("sys", &Value::empty_mapping(), 0)
        .unwrap();
    assert_eq!(data.lookup("netboot_enabled"), Some(&Value::Bool(true)));
}

#[test]
fn key_prefix_nests_the_contribution() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    store.set_value("sys", "flag", &Value::Int(1)).unwrap();
    let source = source(&dir, |config| config.key_prefix = "state:boot".to_string());

    let (data, _) = source
        .get_data("sys", &Value::empty_mapping(), 0)
        .unwrap();
    assert_eq!(data.lookup("state:boot:flag"), Some(&Value::Int(1)));
}

#[test]
fn writes_are_visible_without_caching() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let source = source(&dir, |_| {});

    store.set_value("sys", "flag", &Value::Int(1)).unwrap();
    let (_, first_version) = source
        .get_data("sys", &Value::empty_mapping(), 0)
        .unwrap();

    store.set_value("sys", "flag", &Value::Int(2)).unwrap();
    let (data, second_version) = source
        .get_data("sys", &Value::empty_mapping(), 0)
        .unwrap();
    assert_eq!(data.lookup("flag"), Some(&Value::Int(2)));
    assert_ne!(first_version, second_version);
}

#[test]
fn find_system_requires_a_unique_match() {
    let dir = TempDir::new().unwrap();
    let backing = store(&dir);
    backing
        .set_value("one", "role", &Value::String("compute".to_string()))
        .unwrap();
    backing
        .set_value("two", "role", &Value::String("compute".to_string()))
        .unwrap();
    backing
        .set_value("three", "role", &Value::String("storage".to_string()))
        .unwrap();
    let source = source(&dir, |_| {});

    assert_eq!(
        source
            .find_system("role", &Value::String("storage".to_string()))
            .unwrap()
            .as_deref(),
        Some("three")
    );
    // Two systems share the value, so the lookup is ambiguous.
    assert_eq!(
        source
            .find_system("role", &Value::String("compute".to_string()))
            .unwrap(),
        None
    );
}

#[test]
fn find_system_honors_the_key_prefix() {
    let dir = TempDir::new().unwrap();
    let backing = store(&dir);
    backing
        .set_value("sys", "flag", &Value::Int(1))
        .unwrap();
    let source = source(&dir, |config| config.key_prefix = "state".to_string());

    assert_eq!(
        source
            .find_system("state:flag", &Value::Int(1))
            .unwrap()
            .as_deref(),
        Some("sys")
    );
    // Keys outside the prefix never match.
    assert_eq!(source.find_system("flag", &Value::Int(1)).unwrap(), None);
}

#[test]
fn find_system_can_be_disabled() {
    let dir = TempDir::new().unwrap();
    let backing = store(&dir);
    backing.set_value("sys", "flag", &Value::Int(1)).unwrap();
    let source = source(&dir, |config| config.find_system_enabled = false);

    assert!(!source.supports_find_system());
    assert_eq!(source.find_system("flag", &Value::Int(1)).unwrap(), None);
}
