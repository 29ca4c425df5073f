use std::time::Duration;

use redis_message_queue::Error;
use redis_message_queue::config::{Config, QueueSettings};
use secrecy::ExposeSecret;

// Environment variables are process-global, so every env case runs in one test.
#[test]
fn config_from_env() {
    unsafe {
        std::env::remove_var("REDIS_URL");
        std::env::remove_var("RMQ_CONFIG");
        std::env::remove_var("LOG_LEVEL");
    }
    assert!(matches!(Config::from_env(), Err(Error::Config(_))));

    unsafe {
        std::env::set_var("REDIS_URL", "redis://:hunter2@localhost:6379/0");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.redis_url.expose_secret(), "redis://:hunter2@localhost:6379/0");
    assert!(!format!("{config:?}").contains("hunter2"));
    assert_eq!(config.log_level, "info");
    assert_eq!(config.queue, QueueSettings::default());

    let path = std::env::temp_dir().join(format!("rmq-{}.toml", uuid::Uuid::new_v4()));
    std::fs::write(&path, "enable_failed_queue = true\n").unwrap();
    unsafe {
        std::env::set_var("RMQ_CONFIG", &path);
    }
    let config = Config::from_env().unwrap();
    assert!(config.queue.enable_failed_queue);

    // Clean up
    std::fs::remove_file(&path).ok();
    unsafe {
        std::env::remove_var("REDIS_URL");
        std::env::remove_var("RMQ_CONFIG");
    }
}

#[test]
fn empty_settings_use_defaults() {
    let settings = QueueSettings::from_toml_str("").unwrap();
    assert_eq!(settings, QueueSettings::default());
    assert!(settings.deduplication);
    assert!(!settings.enable_completed_queue);
    assert_eq!(settings.key_separator, "::");

    let options = settings.gateway_options();
    assert_eq!(options.deduplication_ttl, Duration::from_secs(3600));
    assert_eq!(options.message_wait_interval, Duration::from_secs(5));
}

#[test]
fn full_settings_parse() {
    let settings = QueueSettings::from_toml_str(
        r#"
        deduplication = false
        enable_completed_queue = true
        enable_failed_queue = true
        key_separator = ":"
        deduplication_ttl_seconds = 60
        message_wait_interval_seconds = 2

        [retry]
        initial_interval_ms = 50
        max_interval_ms = 1000
        multiplier = 1.5
        jitter = 0.0
        max_elapsed_seconds = 10
        "#,
    )
    .unwrap();

    assert!(!settings.deduplication);
    assert!(settings.enable_completed_queue);
    assert_eq!(settings.key_separator, ":");

    let options = settings.gateway_options();
    assert_eq!(options.deduplication_ttl, Duration::from_secs(60));
    assert_eq!(options.message_wait_interval, Duration::from_secs(2));
    assert_eq!(options.retry.base_delay(0), Duration::from_millis(50));
    assert_eq!(options.retry.base_delay(20), Duration::from_millis(1000));
}

#[test]
fn unknown_fields_are_rejected() {
    let err = QueueSettings::from_toml_str("dedupe = true").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn invalid_values_are_rejected() {
    for toml in [
        "key_separator = \"\"",
        "deduplication_ttl_seconds = 0",
        "message_wait_interval_seconds = 0",
        "[retry]\njitter = 1.5",
        "[retry]\nmultiplier = 0.5",
        "[retry]\ninitial_interval_ms = 10000\nmax_interval_ms = 100",
    ] {
        let result = QueueSettings::from_toml_str(toml);
        assert!(matches!(result, Err(Error::Config(_))), "accepted: {toml}");
    }
}

#[test]
fn missing_file_is_a_config_error() {
    let err = QueueSettings::load("/nonexistent/rmq.toml").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
