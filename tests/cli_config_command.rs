//! Integration tests for the `config` CLI subcommand and its template.

use claudefront::cli::generate_config_template;
use claudefront::config::Config;

#[test]
fn template_is_valid_toml() {
    let template = generate_config_template();
    let result: Result<toml::Value, _> = toml::from_str(template);
    assert!(result.is_ok(), "template should be valid TOML: {:?}", result.err());
}

#[test]
fn template_has_all_sections() {
    let template = generate_config_template();
    for section in ["[server]", "[retry]", "[request_suspend]", "[[endpoints]]", "[tracking]", "[observability]"] {
        assert!(template.contains(section), "missing section {section}");
    }
}

#[test]
fn template_parses_into_a_valid_config() {
    let template = generate_config_template();
    let config: Config = toml::from_str(template).expect("template should deserialize");
    config.validate().expect("template config should pass validation");
}
