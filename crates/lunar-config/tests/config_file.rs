use std::path::PathBuf;

use lunar_config::{ConfigError, LunarConfig};
use pretty_assertions::assert_eq;

#[test]
fn loads_a_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lunar.toml");
    std::fs::write(
        &path,
        r#"
[debugger]
host = "192.168.1.20"
port = 8818
reply_timeout_ms = 2500

[logging]
level = "lunar.debug=trace"
json = true
file = "/tmp/lunar-test.log"
"#,
    )
    .unwrap();

    let config = LunarConfig::load_from_path(&path).unwrap();
    assert_eq!(config.debugger.host, "192.168.1.20");
    assert_eq!(config.debugger.port, 8818);
    assert_eq!(config.debugger.reply_timeout_ms, 2500);
    assert_eq!(config.debugger.max_depth, 8);
    assert!(config.logging.json);
    assert_eq!(config.logging.file, Some(PathBuf::from("/tmp/lunar-test.log")));

    let resolved = LunarConfig::resolve(Some(&path)).unwrap();
    assert_eq!(resolved, config);
}

#[test]
fn missing_file_reports_its_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    let err = LunarConfig::load_from_path(&path).unwrap_err();
    match &err {
        ConfigError::Io { path: reported, .. } => assert_eq!(reported, &path.display().to_string()),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn invalid_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[debugger]\nmax_depth = 0\n").unwrap();

    assert!(matches!(
        LunarConfig::load_from_path(&path),
        Err(ConfigError::Invalid(_))
    ));
}
