//! Tests for the bundled template engine.

use super::*;
use tempfile::TempDir;

fn engine() -> HandlebarsEngine {
    HandlebarsEngine::new(EngineConfig::default())
}

fn write_template(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn context_with_data(yaml: &str) -> Context {
    Context {
        id: Some("myhost.example.com".to_string()),
        data: Some(Value::from(
            serde_yaml::from_str::<serde_yaml::Value>(yaml).unwrap(),
        )),
        request_info: None,
    }
}

fn render(engine: &HandlebarsEngine, path: &Path, context: &Context) -> String {
    String::from_utf8(engine.render(path, context).unwrap()).unwrap()
}

mod rendering {
    use super::*;

    #[test]
    fn expands_id_and_data() {
        let dir = TempDir::new().unwrap();
        let path = write_template(
            &dir,
            "grub.cfg",
            "menuentry {{id}} {\n  linux /vmlinuz ip={{data.net.ipv4_addr}}\n}\n",
        );
        let rendered = render(
            &engine(),
            &path,
            &context_with_data("net:\n  ipv4_addr: 192.0.2.1\n"),
        );
        assert_eq!(
            rendered,
            "menuentry myhost.example.com {\n  linux /vmlinuz ip=192.0.2.1\n}\n"
        );
    }

    #[test]
    fn missing_id_renders_the_fallback_branch() {
        let dir = TempDir::new().unwrap();
        let path = write_template(
            &dir,
            "default.cfg",
            "{{#if id}}boot {{id}}{{else}}boot local{{/if}}",
        );
        let rendered = render(&engine(), &path, &Context::default());
        assert_eq!(rendered, "boot local");
    }

    #[test]
    fn output_is_not_html_escaped() {
        let dir = TempDir::new().unwrap();
        let path = write_template(&dir, "t", "{{data.cmdline}}");
        let rendered = render(
            &engine(),
            &path,
            &context_with_data("cmdline: console=ttyS0 \"quiet\" <rdinit>\n"),
        );
        assert_eq!(rendered, "console=ttyS0 \"quiet\" <rdinit>");
    }

    #[test]
    fn missing_template_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = engine()
            .render(&dir.path().join("absent"), &Context::default())
            .unwrap_err();
        assert!(matches!(err, TemplateError::NotFound { .. }));
    }

    #[test]
    fn syntax_errors_report_the_path() {
        let dir = TempDir::new().unwrap();
        let path = write_template(&dir, "bad", "{{#if x}}unclosed");
        let err = engine().render(&path, &Context::default()).unwrap_err();
        match err {
            TemplateError::Render { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("Expected Render, got {other:?}"),
        }
    }

    #[test]
    fn file_changes_invalidate_the_compiled_template() {
        let dir = TempDir::new().unwrap();
        let engine = engine();
        let path = write_template(&dir, "t", "one");
        assert_eq!(render(&engine, &path, &Context::default()), "one");
        std::fs::write(&path, "two-changed").unwrap();
        assert_eq!(render(&engine, &path, &Context::default()), "two-changed");
    }
}

mod helpers {
    use super::*;

    #[test]
    fn transform_calls_registry_functions() {
        let dir = TempDir::new().unwrap();
        let path = write_template(
            &dir,
            "t",
            "{{transform \"mac_address.normalize\" data.mac}}",
        );
        let rendered = render(&engine(), &path, &context_with_data("mac: 02-AB-CD-EF-01-02\n"));
        assert_eq!(rendered, "02:ab:cd:ef:01:02");
    }

    #[test]
    fn transform_with_extra_arguments() {
        let dir = TempDir::new().unwrap();
        let path = write_template(
            &dir,
            "t",
            "{{transform \"string.add_suffix\" data.host \".example.com\"}}",
        );
        let rendered = render(&engine(), &path, &context_with_data("host: myhost\n"));
        assert_eq!(rendered, "myhost.example.com");
    }

    #[test]
    fn transform_failure_fails_the_rendering() {
        let dir = TempDir::new().unwrap();
        let path = write_template(
            &dir,
            "t",
            "{{transform \"mac_address.normalize\" data.mac}}",
        );
        let err = engine()
            .render(&path, &context_with_data("mac: not-a-mac\n"))
            .unwrap_err();
        assert!(matches!(err, TemplateError::Render { .. }));
    }

    #[test]
    fn to_yaml_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = write_template(&dir, "t", "{{to_yaml data.net}}");
        let rendered = render(
            &engine(),
            &path,
            &context_with_data("net:\n  a: 1\n  b: [x, y]\n"),
        );
        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed["a"], serde_yaml::Value::from(1));
        assert_eq!(parsed["b"][1], serde_yaml::Value::from("y"));
    }

    #[test]
    fn to_json_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = write_template(&dir, "t", "{{to_json data}}");
        let rendered = render(&engine(), &path, &context_with_data("a: [1, 2]\n"));
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["a"][1], serde_json::json!(2));
    }

    #[test]
    fn raise_fails_with_the_given_message() {
        let dir = TempDir::new().unwrap();
        let path = write_template(&dir, "t", "{{raise \"unsupported system\"}}");
        let err = engine().render(&path, &Context::default()).unwrap_err();
        assert!(err.to_string().contains("unsupported system"), "{err}");
    }
}

mod partials {
    use super::*;

    #[test]
    fn partials_directory_files_are_available_by_stem() {
        let dir = TempDir::new().unwrap();
        let partials = dir.path().join("partials");
        std::fs::create_dir(&partials).unwrap();
        std::fs::write(partials.join("footer.hbs"), "# generated for {{id}}").unwrap();

        let engine = HandlebarsEngine::new(EngineConfig {
            partials_dir: Some(partials),
        });
        let path = write_template(&dir, "t", "body\n{{> footer}}");
        let rendered = render(
            &engine,
            &path,
            &Context {
                id: Some("sys".to_string()),
                ..Context::default()
            },
        );
        assert_eq!(rendered, "body\n# generated for sys");
    }

    #[test]
    fn dependencies_include_template_and_partials() {
        let dir = TempDir::new().unwrap();
        let partials = dir.path().join("partials");
        std::fs::create_dir(&partials).unwrap();
        let partial_path = partials.join("footer.hbs");
        std::fs::write(&partial_path, "x").unwrap();

        let engine = HandlebarsEngine::new(EngineConfig {
            partials_dir: Some(partials),
        });
        let template = write_template(&dir, "t", "x");
        let dependencies = engine.resolve_dependencies(&template);
        assert!(dependencies.contains(&template));
        assert!(dependencies.contains(&partial_path));
    }
}
