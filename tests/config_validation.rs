//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use std::time::Duration;
use usc_tunnel::config::{
    Concurrency, LoggingConfig, ServiceConfig, ServiceRole, TlsSettings, TunnelConfig,
};

fn initiator() -> ServiceConfig {
    ServiceConfig {
        name: "client".into(),
        role: ServiceRole::Initiator,
        accept: Some("127.0.0.1:8300".into()),
        connect: vec!["device.lab:6513".into()],
        ..ServiceConfig::default()
    }
}

fn responder() -> ServiceConfig {
    ServiceConfig {
        name: "device".into(),
        role: ServiceRole::Responder,
        accept: Some("0.0.0.0:6513".into()),
        connect: vec!["127.0.0.1:830".into()],
        tls: TlsSettings {
            cert_path: Some("/etc/usc/cert.pem".into()),
            key_path: Some("/etc/usc/key.pem".into()),
            ..TlsSettings::default()
        },
        ..ServiceConfig::default()
    }
}

fn with_services(services: Vec<ServiceConfig>) -> TunnelConfig {
    TunnelConfig::default_with_overrides(|c| c.services = services)
}

#[test]
fn test_valid_pair_has_no_errors() {
    let config = with_services(vec![initiator(), responder()]);
    let errors = config.validate();
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_no_services() {
    let errors = TunnelConfig::default().validate();
    assert!(errors.iter().any(|e| e.contains("At least one [[service]]")));
}

#[test]
fn test_duplicate_service_names() {
    let mut second = responder();
    second.name = "client".into();
    let errors = with_services(vec![initiator(), second]).validate();
    assert!(errors.iter().any(|e| e.contains("Duplicate service name")));
}

#[test]
fn test_initiator_without_accept() {
    let mut svc = initiator();
    svc.accept = None;
    let errors = svc.validate();
    assert!(errors.iter().any(|e| e.contains("initiator requires 'accept'")));
}

#[test]
fn test_responder_accept_and_call_home_exclusive() {
    let mut svc = responder();
    svc.call_home = Some("manager:4335".into());
    let errors = svc.validate();
    assert!(errors.iter().any(|e| e.contains("mutually exclusive")));

    svc.accept = None;
    assert!(svc.validate().is_empty());
}

#[test]
fn test_responder_requires_certificate() {
    let mut svc = responder();
    svc.tls.cert_path = None;
    svc.tls.key_path = None;
    let errors = svc.validate();
    assert!(errors.iter().any(|e| e.contains("responder requires tls.cert_path")));
}

#[test]
fn test_invalid_addresses() {
    let mut svc = initiator();
    svc.accept = Some("no-port".into());
    svc.connect = vec!["host:99999".into()];
    let errors = svc.validate();
    assert_eq!(
        errors.iter().filter(|e| e.contains("expected format: 'host:port'")).count(),
        2
    );
}

#[test]
fn test_buffer_size_bounds() {
    let mut svc = initiator();
    svc.buffer_size = 512;
    assert!(svc.validate().iter().any(|e| e.contains("buffer_size too small")));
    svc.buffer_size = 32 * 1024 * 1024;
    assert!(svc.validate().iter().any(|e| e.contains("buffer_size too large")));
}

#[test]
fn test_timeout_minimums() {
    let mut svc = initiator();
    svc.idle_timeout = Duration::from_millis(5);
    svc.connect_timeout = Duration::ZERO;
    let errors = svc.validate();
    assert!(errors.iter().any(|e| e.contains("idle_timeout too short")));
    assert!(errors.iter().any(|e| e.contains("connect_timeout too short")));
}

#[test]
fn test_heartbeat_only_for_initiators() {
    let mut svc = responder();
    svc.heartbeat_interval = Some(Duration::from_secs(30));
    assert!(svc
        .validate()
        .iter()
        .any(|e| e.contains("heartbeat_interval applies to initiators only")));

    let mut svc = initiator();
    svc.heartbeat_interval = Some(Duration::from_secs(30));
    assert!(svc.validate().is_empty());
}

#[test]
fn test_bad_pin_rejected() {
    let mut svc = initiator();
    svc.tls.pinned_sha256 = Some("abcd".into());
    assert!(svc.validate().iter().any(|e| e.contains("pinned_sha256")));
}

#[test]
fn test_unknown_tls_version() {
    let mut svc = initiator();
    svc.tls.versions = vec!["TLSv1.3".into(), "SSLv3".into()];
    assert!(svc.validate().iter().any(|e| e.contains("unknown TLS version 'SSLv3'")));
}

#[test]
fn test_insecure_is_only_a_warning() {
    let mut svc = initiator();
    svc.tls.insecure = true;
    let config = with_services(vec![svc]);
    let errors = config.validate();
    assert!(errors.iter().all(|e| e.starts_with("WARNING:")));
    assert!(!errors.is_empty());
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_zero_max_clients() {
    let mut config = with_services(vec![initiator()]);
    config.global.max_clients = 0;
    assert!(config.validate_strict().is_err());
}

#[test]
fn test_logging_requires_an_output() {
    let logging = LoggingConfig {
        log_to_console: false,
        ..LoggingConfig::default()
    };
    assert!(logging
        .validate()
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_toml_parsing_with_global_section() {
    let config = TunnelConfig::from_toml(
        r#"
        [global]
        concurrency = "cooperative"
        max_clients = 64

        [[service]]
        name = "client"
        accept = "127.0.0.1:8300"
        connect = ["10.0.0.1:6513", "10.0.0.2:6513"]
        idle_timeout = 60000

        [service.tls]
        server_name = "device.lab"
        versions = ["TLSv1.2", "TLSv1.3"]
        "#,
    )
    .expect("parse");
    assert_eq!(config.global.concurrency, Concurrency::Cooperative);
    assert_eq!(config.global.max_clients, 64);
    let svc = config.service("client").expect("service");
    assert_eq!(svc.connect.len(), 2);
    assert_eq!(svc.idle_timeout, Duration::from_secs(60));
    assert_eq!(svc.server_name().as_deref(), Some("device.lab"));
    assert_eq!(svc.tls.tls_versions().map(|v| v.len()), Some(2));
    assert!(config.validate().is_empty());
}

#[test]
fn test_save_and_reload() {
    let config = with_services(vec![initiator(), responder()]);
    let path = std::env::temp_dir().join(format!("usc-tunnel-cfg-{}.toml", std::process::id()));
    config.save_to_file(&path).expect("save");
    let loaded = TunnelConfig::from_file(&path).expect("load");
    let _ = std::fs::remove_file(&path);
    assert_eq!(loaded.services.len(), 2);
    assert_eq!(loaded.services[1].role, ServiceRole::Responder);
    assert_eq!(loaded.services[0].busy_timeout, config.services[0].busy_timeout);
}

#[test]
fn test_missing_file() {
    assert!(TunnelConfig::from_file("/nonexistent/usc-tunnel.toml").is_err());
}

#[test]
fn test_environment_overrides_loaded_file() {
    let mut config = with_services(vec![initiator()]);
    std::env::set_var("USC_TUNNEL_CONCURRENCY", "cooperative");
    std::env::set_var("USC_TUNNEL_MAX_CLIENTS", "7");
    let applied = config.apply_env();
    std::env::remove_var("USC_TUNNEL_CONCURRENCY");
    std::env::remove_var("USC_TUNNEL_MAX_CLIENTS");
    applied.expect("overrides");
    assert_eq!(config.global.concurrency, Concurrency::Cooperative);
    assert_eq!(config.global.max_clients, 7);
    assert_eq!(config.services.len(), 1);

    std::env::set_var("USC_TUNNEL_CONCURRENCY", "green-threads");
    let applied = config.apply_env();
    std::env::remove_var("USC_TUNNEL_CONCURRENCY");
    assert!(applied.is_err());
}
