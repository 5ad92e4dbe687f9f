use super::*;
use crate::errors::SandboxError;
use crate::input::InputStrategy;
use crate::language::PayloadRef;
use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;

const SAMPLE: &str = r#"
session:
  prefer_thread: false
  timeout:
    interval_ms: 250
    max_checks: 2
  input:
    strategy: local_store
    directory: /tmp/replbox-input
  environments: [plan9, unix]
languages:
  - system_name: shell
    name: Shell
    extension: sh
    matchings: [["(", ")"]]
    scripts:
      - replbox-guest
      - { unix: /opt/lib/prelude.sh, default: /opt/lib/prelude-generic.sh }
    engine: builtin:shell
"#;

fn clear_env() {
    std::env::remove_var(ENV_PREFER_THREAD);
    std::env::remove_var(ENV_TIMEOUT_MS);
    std::env::remove_var(ENV_INPUT_URL);
}

#[test]
#[serial]
fn test_parse_full_config() {
    clear_env();
    let config = ConfigLoader::from_str(SAMPLE).unwrap();

    assert!(!config.session.prefer_thread);
    assert!(config.session.thread_support);
    assert_eq!(
        config.session.timeout,
        Some(TimeoutSettings {
            interval_ms: 250,
            max_checks: 2
        })
    );
    assert_eq!(
        config.session.input,
        InputStrategy::LocalStore {
            directory: Some("/tmp/replbox-input".into())
        }
    );

    let language = &config.languages[0];
    assert_eq!(language.matchings, vec![("(".to_string(), ")".to_string())]);
    assert!(matches!(language.scripts[1], PayloadRef::Conditional(_)));

    let payloads = language.resolve_payloads(&config.environment_table()).unwrap();
    assert_eq!(
        payloads,
        vec!["replbox-guest", "/opt/lib/prelude.sh", "builtin:shell"]
    );
}

#[test]
#[serial]
fn test_empty_config_uses_builtin_languages() {
    clear_env();
    let config = ConfigLoader::from_str("{}").unwrap();
    let registry = config.registry().unwrap();
    assert_eq!(registry.names(), vec!["echo", "shell"]);
    assert!(config.session.prefer_thread);
    assert!(config.session.timeout.is_none());
}

#[test]
#[serial]
fn test_validation_rejects_bad_values() {
    clear_env();
    let zero_timeout = "session:\n  timeout: { interval_ms: 0 }\n";
    assert!(matches!(
        ConfigLoader::from_str(zero_timeout),
        Err(SandboxError::Config(_))
    ));

    let duplicate = r#"
languages:
  - { system_name: a, name: A, scripts: [x], engine: builtin:echo }
  - { system_name: a, name: B, scripts: [y], engine: builtin:echo }
"#;
    assert!(matches!(ConfigLoader::from_str(duplicate), Err(SandboxError::Config(_))));

    let no_scripts = "languages:\n  - { system_name: a, name: A, scripts: [], engine: builtin:echo }\n";
    assert!(matches!(ConfigLoader::from_str(no_scripts), Err(SandboxError::Config(_))));

    let no_engine = "languages:\n  - { system_name: a, name: A, scripts: [x], engine: '' }\n";
    assert!(matches!(ConfigLoader::from_str(no_engine), Err(SandboxError::Config(_))));

    assert!(matches!(
        ConfigLoader::from_str("session: [not, a, map]"),
        Err(SandboxError::Config(_))
    ));
}

#[test]
#[serial]
fn test_environment_overrides() {
    clear_env();
    std::env::set_var(ENV_PREFER_THREAD, "no");
    std::env::set_var(ENV_TIMEOUT_MS, "1200");
    std::env::set_var(ENV_INPUT_URL, "https://input.example.com/session/");

    let config = ConfigLoader::defaults();
    clear_env();
    let config = config.unwrap();

    assert!(!config.session.prefer_thread);
    assert_eq!(
        config.session.timeout,
        Some(TimeoutSettings {
            interval_ms: 1200,
            max_checks: 3
        })
    );
    assert_eq!(
        config.session.input,
        InputStrategy::Remote {
            url: "https://input.example.com/session/".to_string()
        }
    );
}

#[test]
#[serial]
fn test_invalid_override_is_reported() {
    clear_env();
    std::env::set_var(ENV_TIMEOUT_MS, "soon");
    let result = ConfigLoader::defaults();
    clear_env();
    assert!(matches!(result, Err(SandboxError::Config(_))));
}

#[tokio::test]
#[serial]
async fn test_load_from_file() {
    clear_env();
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(SAMPLE.as_bytes()).unwrap();

    let config = load_config(file.path()).await.unwrap();
    assert_eq!(config.languages.len(), 1);

    let missing = load_config("/definitely/not/here.yaml").await;
    assert!(matches!(missing, Err(SandboxError::Config(_))));
}

#[test]
#[serial]
fn test_session_builder_from_config() {
    clear_env();
    let config = ConfigLoader::from_str("session:\n  input: { strategy: remote, url: 'ftp://x/' }\n").unwrap();
    let result = config.session_builder().unwrap().build();
    assert!(matches!(result, Err(SandboxError::UnsupportedDeliveryMechanism(_))));
}
