//! Tests for the system matcher expression language.

use super::*;

/// Parses a YAML document into a data tree.
fn data(yaml: &str) -> Value {
    Value::from(serde_yaml::from_str::<serde_yaml::Value>(yaml).unwrap())
}

/// Compiles an expression and matches it against an ID with empty data.
fn matches_id(expression: &str, system_id: &str) -> bool {
    Matcher::parse(expression)
        .unwrap()
        .matches(system_id, &Value::empty_mapping())
}

mod globs {
    use super::*;

    #[test]
    fn bare_literal_is_an_exact_glob() {
        assert!(matches_id("abc.example.com", "abc.example.com"));
        assert!(!matches_id("abc.example.com", "abc.example.net"));
    }

    #[test]
    fn wildcards_match_any_run() {
        assert!(matches_id("*.example.com", "abc.example.com"));
        assert!(matches_id("*.example.com", "123.456.example.com"));
        assert!(!matches_id("*.example.com", "abc.example.net"));
    }

    #[test]
    fn matching_is_case_insensitive_by_default() {
        assert!(matches_id("*.Example.COM", "abc.example.com"));
        assert!(matches_id("id ABC.example.com", "abc.EXAMPLE.com"));
    }

    #[test]
    fn explicit_glob_keyword_with_sensitivity_flag() {
        assert!(matches_id("glob *.example.com", "abc.example.com"));
        assert!(!matches_id("glob/s *.Example.com", "abc.example.com"));
        assert!(matches_id("glob/s *.example.com", "abc.example.com"));
    }
}

mod operators {
    use super::*;

    #[test]
    fn or_combines_alternatives() {
        let expr = "*.example.com or *.example.net";
        assert!(matches_id(expr, "abc.example.com"));
        assert!(matches_id(expr, "123.example.net"));
        assert!(!matches_id(expr, "def.example.org"));
    }

    #[test]
    fn and_not_combination() {
        let expr = "*.example.com and not abc.*";
        assert!(matches_id(expr, "def.example.com"));
        assert!(matches_id(expr, "abc123.example.com"));
        assert!(!matches_id(expr, "abc.example.com"));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        // Parsed as: a* or (b* and *.net)
        let expr = "a* or b* and *.net";
        assert!(matches_id(expr, "a.example.org"));
        assert!(matches_id(expr, "b.example.net"));
        assert!(!matches_id(expr, "b.example.org"));
    }

    #[test]
    fn parentheses_group() {
        let expr = "(*.example.com or *.example.net) and not abc.*";
        assert!(matches_id(expr, "def.example.com"));
        assert!(matches_id(expr, "def.example.net"));
        assert!(!matches_id(expr, "abc.example.com"));
    }

    #[test]
    fn parentheses_need_no_whitespace() {
        assert!(!matches_id("(a* or b*)and c*", "a-host"));
        assert!(matches_id("(a* )or( b*)", "b-host"));
    }
}

mod regex_and_id_terms {
    use super::*;

    #[test]
    fn regex_must_match_the_whole_id() {
        assert!(matches_id("re .*\\.example\\.com", "abc.example.com"));
        assert!(!matches_id("re example", "abc.example.com"));
    }

    #[test]
    fn regex_case_flag() {
        assert!(matches_id("re ABC\\..*", "abc.example.com"));
        assert!(!matches_id("re/s ABC\\..*", "abc.example.com"));
    }

    #[test]
    fn id_literal_is_not_a_glob() {
        assert!(!matches_id("id *.example.com", "abc.example.com"));
        assert!(matches_id("id abc.example.com", "abc.example.com"));
        assert!(!matches_id("id/s ABC.example.com", "abc.example.com"));
    }
}

mod data_terms {
    use super::*;

    #[test]
    fn equality_against_nested_key() {
        let data = data("net:\n  hostname: myhost\n");
        let matcher = Matcher::parse("@net:hostname == myhost").unwrap();
        assert!(matcher.matches("any", &data));
        let matcher = Matcher::parse("@net:hostname == other").unwrap();
        assert!(!matcher.matches("any", &data));
    }

    #[test]
    fn equality_is_case_insensitive_unless_flagged() {
        let data = data("role: Compute\n");
        assert!(Matcher::parse("@role == compute").unwrap().matches("x", &data));
        assert!(!Matcher::parse("@role ==/s compute").unwrap().matches("x", &data));
        assert!(Matcher::parse("@role ==/s Compute").unwrap().matches("x", &data));
    }

    #[test]
    fn inequality_matches_absent_keys() {
        let data = data("net:\n  hostname: myhost\n");
        assert!(Matcher::parse("@net:missing != x").unwrap().matches("x", &data));
        assert!(Matcher::parse("@net:hostname != other").unwrap().matches("x", &data));
        assert!(!Matcher::parse("@net:hostname != myhost").unwrap().matches("x", &data));
    }

    #[test]
    fn regex_op_matches_the_stored_value() {
        let data = data("net:\n  fqdn: myhost.example.com\n");
        assert!(Matcher::parse("@net:fqdn ~= myhost\\..*")
            .unwrap()
            .matches("x", &data));
        assert!(!Matcher::parse("@net:fqdn ~= otherhost\\..*")
            .unwrap()
            .matches("x", &data));
        // Absent keys never satisfy a regex comparison.
        assert!(!Matcher::parse("@net:missing ~= .*").unwrap().matches("x", &data));
    }

    #[test]
    fn non_string_scalars_compare_through_their_rendering() {
        let data = data("netboot: true\nslot: 7\n");
        assert!(Matcher::parse("@netboot == true").unwrap().matches("x", &data));
        assert!(Matcher::parse("@slot == 7").unwrap().matches("x", &data));
    }

    #[test]
    fn subnet_literal_tests_membership() {
        let data = data("net:\n  ipv4_addr: 192.0.2.17\n");
        assert!(Matcher::parse("@net:ipv4_addr == 192.0.2.0/24")
            .unwrap()
            .matches("x", &data));
        assert!(!Matcher::parse("@net:ipv4_addr == 198.51.100.0/24")
            .unwrap()
            .matches("x", &data));
        assert!(Matcher::parse("@net:ipv4_addr != 198.51.100.0/24")
            .unwrap()
            .matches("x", &data));
    }

    #[test]
    fn subnet_test_works_for_ipv6() {
        let data = data("addr: 2001:db8::17\n");
        assert!(Matcher::parse("@addr == 2001:db8::/32").unwrap().matches("x", &data));
        assert!(!Matcher::parse("@addr == 2001:db9::/32").unwrap().matches("x", &data));
    }

    #[test]
    fn quoted_literals_allow_reserved_characters() {
        let data = data("desc: 'hello world (x)'\n");
        assert!(Matcher::parse("@desc == 'hello world (x)'")
            .unwrap()
            .matches("x", &data));
        assert!(Matcher::parse(r#"@desc == "hello world (x)""#)
            .unwrap()
            .matches("x", &data));
    }
}

mod errors {
    use super::*;

    #[test]
    fn empty_expression_fails() {
        assert!(Matcher::parse("").is_err());
        assert!(Matcher::parse("   ").is_err());
    }

    #[test]
    fn dangling_operator_fails() {
        assert!(Matcher::parse("a* and").is_err());
        assert!(Matcher::parse("or a*").is_err());
        assert!(Matcher::parse("not").is_err());
    }

    #[test]
    fn unbalanced_parentheses_fail() {
        assert!(Matcher::parse("(a* or b*").is_err());
        assert!(Matcher::parse("a*)").is_err());
    }

    #[test]
    fn bad_data_operator_fails_with_position() {
        let err = Matcher::parse("@key >= 5").unwrap_err();
        assert_eq!(err.position, 5);
    }

    #[test]
    fn unterminated_quote_fails() {
        assert!(Matcher::parse("id 'abc").is_err());
    }

    #[test]
    fn invalid_regex_fails() {
        assert!(Matcher::parse("re (").is_err());
        assert!(Matcher::parse("re '('").is_err());
    }
}
