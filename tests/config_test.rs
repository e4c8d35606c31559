//! 配置集成测试
//!
//! 测试配置文件加载、分层合并，以及配置对注册中心行为的影响。

use std::io::Cursor;
use std::time::Duration;

use chips_registry::{
    error_code, CoreError, FrameworkConfig, Logger, LoggerConfig, Registry, RotationStrategy,
};
use tempfile::TempDir;

#[tokio::test]
async fn test_layered_config_loading() {
    let temp_dir = TempDir::new().unwrap();

    let system_path = temp_dir.path().join("system.yaml");
    tokio::fs::write(
        &system_path,
        r#"
registry:
  state_change_timeout_ms: 2000
events:
  dispatch_thread_name: system-dispatch
logging:
  level: info
"#,
    )
    .await
    .unwrap();

    let user_path = temp_dir.path().join("user.json");
    tokio::fs::write(
        &user_path,
        r#"{
  "registry": { "allow_duplicate_modules": true },
  "logging": { "level": "debug", "filter_directives": "chips_registry::event=trace" }
}"#,
    )
    .await
    .unwrap();

    let mut config = FrameworkConfig::from_file(&system_path).await.unwrap();
    assert_eq!(config.config_path.as_deref(), Some(system_path.as_path()));
    config.merge(FrameworkConfig::from_file(&user_path).await.unwrap());

    // 用户层只覆盖它显式设置的项
    assert_eq!(config.registry.state_change_timeout(), Duration::from_secs(2));
    assert!(config.registry.allow_duplicate_modules);
    assert_eq!(config.events.dispatch_thread_name, "system-dispatch");
    assert!(config.events.deliver_async_events);
    assert_eq!(config.logging.level, "debug");
    assert_eq!(
        config.logging.filter_directives.as_deref(),
        Some("chips_registry::event=trace")
    );
}

#[tokio::test]
async fn test_missing_and_malformed_files() {
    let temp_dir = TempDir::new().unwrap();

    let missing = FrameworkConfig::from_file(temp_dir.path().join("absent.yaml")).await;
    assert!(matches!(missing, Err(CoreError::Io(_))));

    let broken = temp_dir.path().join("broken.yaml");
    tokio::fs::write(&broken, "registry: [not, a, map]\n").await.unwrap();
    assert!(matches!(
        FrameworkConfig::from_file(&broken).await,
        Err(CoreError::Yaml(_))
    ));

    let invalid = temp_dir.path().join("invalid.json");
    tokio::fs::write(&invalid, r#"{"events": {"dispatch_thread_name": "  "}}"#)
        .await
        .unwrap();
    match FrameworkConfig::from_file(&invalid).await {
        Err(e @ CoreError::InvalidConfigValue { .. }) => {
            assert_eq!(e.error_code(), error_code::CONFIG_INVALID_VALUE);
        }
        other => panic!("expected invalid config value, got {other:?}"),
    }
}

#[test]
fn test_registry_rejects_invalid_config() {
    let config = FrameworkConfig::builder()
        .state_change_timeout(Duration::ZERO)
        .build();
    let result = Registry::builder().config(config).build();
    assert!(matches!(result, Err(CoreError::InvalidConfigValue { .. })));
}

#[test]
fn test_config_controls_duplicate_identity() {
    let manifest = "Module-SymbolicName: com.acme.dup\nModule-Version: 1.0.0\n";
    let install = |registry: &Registry, location: &str| {
        let mut reader = Cursor::new(manifest);
        registry.install(location, Some(&mut reader))
    };

    let strict = Registry::builder()
        .config(FrameworkConfig::builder().without_async_events().build())
        .build()
        .unwrap();
    install(&strict, "mem:first").unwrap();
    assert!(matches!(
        install(&strict, "mem:second"),
        Err(CoreError::DuplicateIdentity { .. })
    ));

    let yaml = "registry:\n  allow_duplicate_modules: true\nevents:\n  deliver_async_events: false\n";
    let relaxed = Registry::builder()
        .config(FrameworkConfig::from_yaml_str(yaml).unwrap())
        .build()
        .unwrap();
    install(&relaxed, "mem:first").unwrap();
    install(&relaxed, "mem:second").unwrap();
    assert_eq!(relaxed.modules().len(), 2);
}

#[test]
fn test_logger_config_follows_framework_config() {
    let temp_dir = TempDir::new().unwrap();
    let config = FrameworkConfig::from_yaml_str(&format!(
        "logging:\n  level: warn\n  json_format: true\n  rotation: hourly\n  file_output: true\n  log_dir: {}\n",
        temp_dir.path().display()
    ))
    .unwrap();

    let logger = LoggerConfig::from_log_config(&config.logging).unwrap();
    assert_eq!(logger.level, tracing::Level::WARN);
    assert!(logger.json_format);
    assert_eq!(logger.rotation, RotationStrategy::Hourly);
    assert_eq!(logger.log_dir.as_deref(), Some(temp_dir.path()));

    let bad = FrameworkConfig::from_yaml_str("logging:\n  rotation: weekly\n").unwrap();
    assert!(matches!(
        Logger::init_from(&bad),
        Err(CoreError::InvalidConfigValue { .. })
    ));
}
