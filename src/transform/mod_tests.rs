//! Tests for the transform registry and built-in transforms.

use super::*;

/// Builds a chain from inline YAML.
fn chain(yaml: &str) -> Result<TransformChain, ChainError> {
    let spec: ChainSpec = serde_yaml::from_str(yaml).unwrap();
    TransformChain::from_spec(&spec)
}

/// Applies a chain described as YAML to a string value.
fn apply(yaml: &str, input: &str) -> Value {
    chain(yaml)
        .unwrap()
        .apply(Value::String(input.to_string()))
        .unwrap()
}

mod chains {
    use super::*;

    #[test]
    fn bare_name_and_mapping_forms_compose() {
        let result = apply(
            "- string.to_upper\n- string.add_suffix: .def\n",
            "abc",
        );
        assert_eq!(result, Value::String("ABC.def".to_string()));
    }

    #[test]
    fn sequence_args_are_positional() {
        let result = apply("- string.split: [',', 1]\n", "a,b,c");
        assert_eq!(
            result,
            Value::Sequence(vec![
                Value::String("a".to_string()),
                Value::String("b,c".to_string())
            ])
        );
    }

    #[test]
    fn mapping_args_are_named() {
        let result = apply(
            "- string.split:\n    sep: '.'\n    maxsplit: -1\n",
            "a.b.c",
        );
        assert_eq!(
            result,
            Value::Sequence(vec![
                Value::String("a".to_string()),
                Value::String("b".to_string()),
                Value::String("c".to_string())
            ])
        );
    }

    #[test]
    fn unknown_function_fails_chain_construction() {
        let err = chain("- string.does_not_exist\n").unwrap_err();
        assert!(matches!(err, ChainError::UnknownFunction(name) if name == "string.does_not_exist"));
    }

    #[test]
    fn multi_entry_mapping_is_malformed() {
        let err = chain("- string.to_upper: ~\n  string.to_lower: ~\n").unwrap_err();
        assert!(matches!(err, ChainError::MalformedStep));
    }

    #[test]
    fn wrong_argument_kind_is_a_transform_error() {
        let result = chain("- string.add_suffix: [1]\n")
            .unwrap()
            .apply(Value::String("x".to_string()));
        assert!(matches!(
            result,
            Err(TransformError::ArgumentKind { name: "suffix", .. })
        ));
    }

    #[test]
    fn empty_chain_is_identity() {
        let chain = chain("[]").unwrap();
        assert!(chain.is_empty());
        assert_eq!(
            chain.apply(Value::Int(7)).unwrap(),
            Value::Int(7)
        );
    }
}

mod string_transforms {
    use super::*;

    #[test]
    fn case_conversions() {
        assert_eq!(apply("- string.to_lower\n", "AbC"), Value::String("abc".into()));
        assert_eq!(apply("- string.to_upper\n", "AbC"), Value::String("ABC".into()));
    }

    #[test]
    fn prefix_and_suffix() {
        assert_eq!(
            apply("- string.add_prefix: 'pre-'\n", "x"),
            Value::String("pre-x".into())
        );
        assert_eq!(
            apply("- string.remove_prefix: 'pre-'\n", "pre-x"),
            Value::String("x".into())
        );
        assert_eq!(
            apply("- string.remove_suffix: '.x'\n", "name.x"),
            Value::String("name".into())
        );
        // A suffix that is not present leaves the value untouched.
        assert_eq!(
            apply("- string.remove_suffix: '.y'\n", "name.x"),
            Value::String("name.x".into())
        );
    }

    #[test]
    fn split_on_whitespace_by_default() {
        assert_eq!(
            apply("- string.split\n", "  a  b c "),
            Value::Sequence(vec![
                Value::String("a".into()),
                Value::String("b".into()),
                Value::String("c".into())
            ])
        );
    }

    #[test]
    fn to_str_accepts_any_value() {
        let chain = chain("- string.to_str\n").unwrap();
        assert_eq!(chain.apply(Value::Int(42)).unwrap(), Value::String("42".into()));
    }

    #[test]
    fn string_transform_rejects_non_string_input() {
        let chain = chain("- string.to_lower\n").unwrap();
        assert!(matches!(
            chain.apply(Value::Int(1)),
            Err(TransformError::InputKind { .. })
        ));
    }
}

mod mac_transforms {
    use super::*;

    #[test]
    fn normalizes_mixed_case_colon_form() {
        assert_eq!(
            apply("- mac_address.normalize\n", "02:aB:Cd:EF:01:02"),
            Value::String("02:ab:cd:ef:01:02".into())
        );
    }

    #[test]
    fn normalizes_dash_and_dotted_forms() {
        assert_eq!(
            apply("- mac_address.normalize\n", "02-ab-cd-ef-01-02"),
            Value::String("02:ab:cd:ef:01:02".into())
        );
        assert_eq!(
            apply("- mac_address.normalize\n", "02aB.CdEF.0102"),
            Value::String("02:ab:cd:ef:01:02".into())
        );
    }

    #[test]
    fn adds_omitted_leading_zeros() {
        assert_eq!(
            apply("- mac_address.normalize\n", "2:a:b:c:d:e"),
            Value::String("02:0a:0b:0c:0d:0e".into())
        );
    }

    #[test]
    fn rejects_mixed_delimiters_and_short_input() {
        let chain = chain("- mac_address.normalize\n").unwrap();
        for bad in ["02:ab-cd:ef:01:02", "02:ab:cd:ef:01", "garbage", ""] {
            assert!(
                chain.apply(Value::String(bad.to_string())).is_err(),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn normalize_is_idempotent() {
        let chain = chain("- mac_address.normalize\n").unwrap();
        let once = chain
            .apply(Value::String("02-AB-CD-EF-01-02".into()))
            .unwrap();
        let twice = chain.apply(once.clone()).unwrap();
        assert_eq!(once, twice);
    }
}

mod ip_transforms {
    use super::*;

    #[test]
    fn ipv4_normalize_strips_leading_zeros() {
        assert_eq!(
            apply("- ipv4_address.normalize\n", "192.168.000.003"),
            Value::String("192.168.0.3".into())
        );
    }

    #[test]
    fn ipv4_normalize_preserves_mask() {
        assert_eq!(
            apply("- ipv4_address.normalize\n", "192.168.0.1/024"),
            Value::String("192.168.0.1/24".into())
        );
    }

    #[test]
    fn ipv4_normalize_rejects_bad_octets_and_masks() {
        let chain = chain("- ipv4_address.normalize\n").unwrap();
        for bad in ["192.168.0.256", "192.168.0.1/33", "192.168.0", "not-an-ip"] {
            assert!(
                chain.apply(Value::String(bad.to_string())).is_err(),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn ipv4_net_and_broadcast_addresses() {
        assert_eq!(
            apply("- ipv4_address.net_address\n", "192.168.0.17/24"),
            Value::String("192.168.0.0/24".into())
        );
        assert_eq!(
            apply("- ipv4_address.broadcast_address\n", "192.168.0.17/24"),
            Value::String("192.168.0.255".into())
        );
        assert_eq!(
            apply("- ipv4_address.strip_mask\n", "192.168.0.17/24"),
            Value::String("192.168.0.17".into())
        );
    }

    #[test]
    fn ip_normalize_handles_both_families() {
        assert_eq!(
            apply("- ip_address.normalize\n", "2001:0db8:0000::0001"),
            Value::String("2001:db8::1".into())
        );
        assert_eq!(
            apply("- ip_address.normalize\n", "192.168.000.001/8"),
            Value::String("192.168.0.1/8".into())
        );
    }

    #[test]
    fn ip_normalize_unwraps_mapped_ipv4() {
        assert_eq!(
            apply("- ip_address.normalize\n", "::ffff:192.0.2.1"),
            Value::String("192.0.2.1".into())
        );
    }

    #[test]
    fn ip_network_and_host() {
        assert_eq!(
            apply("- ip_address.network\n", "2001:db8::1/32"),
            Value::String("2001:db8::/32".into())
        );
        assert_eq!(
            apply("- ip_address.host\n", "2001:db8::1/32"),
            Value::String("2001:db8::1".into())
        );
        assert_eq!(
            apply("- ip_address.network\n", "10.1.2.3/8"),
            Value::String("10.0.0.0/8".into())
        );
    }

    #[test]
    fn ip_network_requires_a_mask() {
        let chain = chain("- ip_address.network\n").unwrap();
        assert!(chain.apply(Value::String("10.1.2.3".into())).is_err());
    }

    #[test]
    fn normalizers_are_idempotent() {
        for (name, input) in [
            ("ipv4_address.normalize", "010.001.002.003/08"),
            ("ip_address.normalize", "2001:0DB8::1"),
        ] {
            let chain = chain(&format!("- {name}\n")).unwrap();
            let once = chain.apply(Value::String(input.to_string())).unwrap();
            let twice = chain.apply(once.clone()).unwrap();
            assert_eq!(once, twice, "{name} must be idempotent");
        }
    }
}
