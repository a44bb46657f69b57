use delver::config::{AgentConfig, ConfigError};
use delver::metrics::ProbeMode;
use delver::policy::InclusionPolicy;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

#[test]
fn defaults() {
    let config = AgentConfig::parse_options("").unwrap();
    assert_eq!(config, AgentConfig::default());
    assert_eq!(config.mode, ProbeMode::Timing);
    assert!(config.snapshot_enabled);
    assert_eq!(config.log_level, "info");
    assert!(config.policy().unwrap().is_none());
}

#[test]
fn inline_options() {
    let config = AgentConfig::parse_options(
        "include=com\\.example\\..*, include=org\\.acme\\.Main,exclude=.*Test,mode=count,snapshot=off,report=/tmp/r.csv,log=debug",
    )
    .unwrap();
    assert_eq!(config.include, ["com\\.example\\..*", "org\\.acme\\.Main"]);
    assert_eq!(config.exclude, [".*Test"]);
    assert_eq!(config.mode, ProbeMode::Count);
    assert!(!config.snapshot_enabled);
    assert_eq!(config.report, Some(PathBuf::from("/tmp/r.csv")));
    assert_eq!(config.log_level, "debug");

    let policy = config.policy().unwrap().unwrap();
    assert!(policy.is_included("com.example.Foo"));
    assert!(policy.is_included("org.acme.Main"));
    assert!(!policy.is_included("org.acme.MainLoop"));
    assert!(policy.is_excluded("com.example.FooTest"));
}

#[test]
fn invalid_options() {
    for options in ["mode=sampling", "snapshot=maybe", "colour=blue", "include"] {
        let err = AgentConfig::parse_options(options).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption(_)), "{options}: {err}");
    }

    let config = AgentConfig::parse_options("include=(unclosed").unwrap();
    assert!(matches!(config.policy(), Err(ConfigError::Pattern(_))));
}

#[test]
fn toml_file() {
    let config = AgentConfig::from_toml_str(
        r#"
        mode = "count"
        include = ["com\\.example\\..*"]
        report = "/tmp/delver.csv"

        [snapshot]
        enabled = false
        initial_delay_secs = 5
        period_secs = 0
        directory = "/var/tmp/delver"
        "#,
    )
    .unwrap();
    assert_eq!(config.mode, ProbeMode::Count);
    assert_eq!(config.include, ["com\\.example\\..*"]);
    assert!(config.exclude.is_empty());
    assert!(!config.snapshot_enabled);
    assert_eq!(config.snapshot.initial_delay, Duration::from_secs(5));
    assert_eq!(config.snapshot.period, Duration::from_secs(1));
    assert_eq!(config.snapshot.directory, Some(PathBuf::from("/var/tmp/delver")));
}

#[test]
fn unknown_toml_keys_are_rejected() {
    assert!(matches!(AgentConfig::from_toml_str("modes = \"count\""), Err(ConfigError::Toml(_))));
    assert!(matches!(
        AgentConfig::from_toml_str("[snapshot]\nperiod = 3"),
        Err(ConfigError::Toml(_))
    ));
    assert!(matches!(AgentConfig::from_toml_str("mode = \"sampling\""), Err(ConfigError::Toml(_))));
}

#[test]
fn inline_options_override_the_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "mode = \"count\"\ninclude = [\"com\\\\.file\\\\..*\"]\nexclude = [\"x\"]").unwrap();

    let options = format!("config={},include=com\\.inline\\..*,mode=timing", file.path().display());
    let config = AgentConfig::parse_options(&options).unwrap();
    assert_eq!(config.mode, ProbeMode::Timing);
    assert_eq!(config.include, ["com\\.inline\\..*"]);
    assert_eq!(config.exclude, ["x"]);
}

#[test]
fn missing_file() {
    let err = AgentConfig::parse_options("config=/nonexistent/delver.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn commas_inside_patterns_stay_in_the_pattern() {
    let config =
        AgentConfig::parse_options("include=com\\.example\\.A{1,3}Service,mode=count,exclude=.*\\$[0-9]{2,},log=warn")
            .unwrap();
    assert_eq!(config.include, ["com\\.example\\.A{1,3}Service"]);
    assert_eq!(config.exclude, [".*\\$[0-9]{2,}"]);
    assert_eq!(config.mode, ProbeMode::Count);
    assert_eq!(config.log_level, "warn");

    let policy = config.policy().unwrap().unwrap();
    assert!(policy.is_included("com.example.AAService"));
    assert!(!policy.is_included("com.example.AAAAService"));
    assert!(policy.is_excluded("com.example.Foo$12"));

    // A stray piece after a non-pattern option is still rejected.
    let err = AgentConfig::parse_options("mode=count,3}").unwrap_err();
    assert!(matches!(err, ConfigError::InvalidOption(ref piece) if piece == "3}"), "{err}");
}

#[test]
fn snapshots_need_a_policy() {
    let mut config = AgentConfig::default();
    assert!(config.resolve_policy().unwrap().is_none());
    assert!(!config.snapshot_enabled);

    let mut config = AgentConfig::parse_options("include=(unclosed").unwrap();
    assert!(config.resolve_policy().is_err());
    assert!(!config.snapshot_enabled);

    let mut config = AgentConfig::parse_options("include=com\\.example\\..*").unwrap();
    assert!(config.resolve_policy().unwrap().is_some());
    assert!(config.snapshot_enabled);
}
