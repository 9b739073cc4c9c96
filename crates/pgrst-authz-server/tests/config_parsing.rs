use std::{env, fs};

use pgrst_authz::EngineKind;
use pgrst_authz_server::ConfigOverrides;
use pgrst_authz_server::config::loader::load_config;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("pgrst-authz.toml");

    let toml_content = r#"
[server]
host = "127.0.0.1"
port = 8081
path_prefix = "/authz"

[auth]
hmac_secret = "reallyreallyreallyreallyverysafe"

[logging]
level = "debug"

[policy]
engine = "quickjs"
policy_path = "/etc/pgrst-authz/policy.js"
evaluation_timeout = "250ms"

[policy.quickjs]
pool_size = 2
timeout_ms = 100
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str(), &ConfigOverrides::default()).expect("should parse config");
    assert_eq!(cfg.server.port, 8081);
    assert_eq!(cfg.server.path_prefix.as_deref(), Some("/authz"));
    assert_eq!(cfg.logging.level, "debug");
    assert_eq!(cfg.policy.engine, EngineKind::QuickJs);
    assert_eq!(cfg.policy.evaluation_timeout.as_millis(), 250);
    assert_eq!(cfg.policy.quickjs.pool_size, 2);
    assert!(cfg.policy.quickjs.pool_enabled);

    // 2) Env override should win over file
    unsafe {
        env::set_var("PGRST_AUTHZ__SERVER__PORT", "9091");
    }
    let cfg_env = load_config(path.to_str(), &ConfigOverrides::default())
        .expect("should parse config with env overrides");
    assert_eq!(cfg_env.server.port, 9091);

    // 3) Command line wins over env
    let overrides = ConfigOverrides {
        port: Some(9092),
        engine: Some("rego".into()),
        pool_enabled: Some(false),
        ..Default::default()
    };
    let cfg_cli =
        load_config(path.to_str(), &overrides).expect("should parse config with overrides");
    assert_eq!(cfg_cli.server.port, 9092);
    assert_eq!(cfg_cli.policy.engine, EngineKind::Rego);
    assert!(!cfg_cli.policy.quickjs.pool_enabled);

    unsafe {
        env::remove_var("PGRST_AUTHZ__SERVER__PORT");
    }

    // 4) Invalid values are rejected
    fs::write(
        &path,
        r#"
[auth]
hmac_secret = ""

[policy]
policy_path = "policy.rego"
"#,
    )
    .expect("write toml");
    let err = load_config(path.to_str(), &ConfigOverrides::default()).unwrap_err();
    assert!(err.contains("hmac_secret"));

    // 5) An explicit path must exist
    let missing = dir.path().join("missing.toml");
    assert!(load_config(missing.to_str(), &ConfigOverrides::default()).is_err());
}
