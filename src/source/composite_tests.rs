//! Tests for the composite data source.

use super::*;

/// Source stub contributing a fixed tree under a fixed version.
struct FixedSource {
    data: Value,
    version: Version,
    find_result: Option<String>,
    supports_find: bool,
}

impl FixedSource {
    fn new(yaml: &str, version: Version) -> Self {
        Self {
            data: Value::from(serde_yaml::from_str::<serde_yaml::Value>(yaml).unwrap()),
            version,
            find_result: None,
            supports_find: true,
        }
    }

    fn finding(mut self, system_id: &str) -> Self {
        self.find_result = Some(system_id.to_string());
        self
    }

    fn without_find(mut self) -> Self {
        self.supports_find = false;
        self
    }
}

impl DataSource for FixedSource {
    fn get_data(
        &self,
        _system_id: &str,
        _preceding: &Value,
        _preceding_version: Version,
    ) -> Result<(Value, Version), DataSourceError> {
        Ok((self.data.clone(), self.version))
    }

    fn find_system(
        &self,
        _key: &str,
        _value: &Value,
    ) -> Result<Option<String>, DataSourceError> {
        if self.supports_find {
            Ok(self.find_result.clone())
        } else {
            panic!("find_system called on a source that does not support it");
        }
    }

    fn supports_find_system(&self) -> bool {
        self.supports_find
    }
}

/// Source stub that always fails.
struct FailingSource;

impl DataSource for FailingSource {
    fn get_data(
        &self,
        _system_id: &str,
        _preceding: &Value,
        _preceding_version: Version,
    ) -> Result<(Value, Version), DataSourceError> {
        Err(DataSourceError::Other("boom".to_string()))
    }

    fn find_system(
        &self,
        _key: &str,
        _value: &Value,
    ) -> Result<Option<String>, DataSourceError> {
        Err(DataSourceError::Other("boom".to_string()))
    }
}

fn composite(sources: Vec<Arc<dyn DataSource>>) -> CompositeDataSource {
    CompositeDataSource::new(sources, false)
}

mod get_data {
    use super::*;

    #[test]
    fn merges_in_declared_order() {
        let first = FixedSource::new("net:\n  hostname: myhost\n", 1);
        let second = FixedSource::new("net:\n  hostname: override\n", 2);
        let composite = composite(vec![Arc::new(first), Arc::new(second)]);

        let (data, _) = composite
            .get_data("sys", &Value::empty_mapping(), 0)
            .unwrap();
        assert_eq!(
            data.lookup("net:hostname"),
            Some(&Value::String("override".to_string()))
        );
    }

    #[test]
    fn is_idempotent_while_versions_hold() {
        let composite = composite(vec![
            Arc::new(FixedSource::new("a: 1\n", 7)),
            Arc::new(FixedSource::new("b: 2\n", 9)),
        ]);
        let (first_data, first_version) = composite
            .get_data("sys", &Value::empty_mapping(), 0)
            .unwrap();
        let (second_data, second_version) = composite
            .get_data("sys", &Value::empty_mapping(), 0)
            .unwrap();
        assert_eq!(first_data, second_data);
        assert_eq!(first_version, second_version);
    }

    #[test]
    fn aggregate_version_tracks_component_versions() {
        let stable = composite(vec![Arc::new(FixedSource::new("a: 1\n", 7))]);
        let changed = composite(vec![Arc::new(FixedSource::new("a: 1\n", 8))]);
        let (_, stable_version) = stable
            .get_data("sys", &Value::empty_mapping(), 0)
            .unwrap();
        let (_, changed_version) = changed
            .get_data("sys", &Value::empty_mapping(), 0)
            .unwrap();
        assert_ne!(stable_version, changed_version);
    }

    #[test]
    fn source_errors_propagate() {
        let composite = composite(vec![
            Arc::new(FixedSource::new("a: 1\n", 1)),
            Arc::new(FailingSource),
        ]);
        assert!(composite
            .get_data("sys", &Value::empty_mapping(), 0)
            .is_err());
    }

    #[test]
    fn merge_lists_flag_is_honored() {
        let composite = CompositeDataSource::new(
            vec![
                Arc::new(FixedSource::new("xs: [1]\n", 1)),
                Arc::new(FixedSource::new("xs: [2]\n", 2)),
            ],
            true,
        );
        let (data, _) = composite
            .get_data("sys", &Value::empty_mapping(), 0)
            .unwrap();
        assert_eq!(
            data.lookup("xs"),
            Some(&Value::Sequence(vec![Value::Int(1), Value::Int(2)]))
        );
    }
}

mod find_system {
    use super::*;

    #[test]
    fn first_claiming_source_wins() {
        let composite = composite(vec![
            Arc::new(FixedSource::new("a: 1\n", 1)),
            Arc::new(FixedSource::new("a: 1\n", 1).finding("first.example.com")),
            Arc::new(FixedSource::new("a: 1\n", 1).finding("second.example.com")),
        ]);
        let found = composite
            .find_system("net:mac_addr", &Value::String("aa".to_string()))
            .unwrap();
        assert_eq!(found.as_deref(), Some("first.example.com"));
    }

    #[test]
    fn unsupported_sources_are_skipped_without_a_call() {
        // FixedSource panics when find_system is called despite
        // supports_find_system being false.
        let composite = composite(vec![
            Arc::new(FixedSource::new("a: 1\n", 1).finding("x").without_find()),
            Arc::new(FixedSource::new("a: 1\n", 1).finding("found.example.com")),
        ]);
        let found = composite
            .find_system("key", &Value::String("v".to_string()))
            .unwrap();
        assert_eq!(found.as_deref(), Some("found.example.com"));
    }

    #[test]
    fn no_source_claims_the_lookup() {
        let composite = composite(vec![Arc::new(FixedSource::new("a: 1\n", 1))]);
        let found = composite
            .find_system("key", &Value::String("v".to_string()))
            .unwrap();
        assert_eq!(found, None);
    }
}
