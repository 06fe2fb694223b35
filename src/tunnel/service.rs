//! Per-service runtime: validated settings plus the TLS configuration built
//! from them once at startup (or reload).

use std::net::TcpStream;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use tracing::debug;

use crate::config::{ServiceConfig, ServiceRole};
use crate::error::Result;
use crate::transport::tls::{parse_pin, TlsClientConfig, TlsServerConfig};
use crate::transport::{SessionCache, TlsSession};

/// Which side of the TLS handshake a service plays
pub enum TlsRole {
    Client {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
    Server {
        config: Arc<ServerConfig>,
    },
}

/// A configured tunnel service
pub struct Service {
    settings: ServiceConfig,
    tls: TlsRole,
    session_cache: Option<Arc<SessionCache>>,
}

impl Service {
    /// Load certificates and build the TLS configuration for `settings`
    pub fn from_config(settings: &ServiceConfig) -> Result<Self> {
        let tls_settings = &settings.tls;
        let mut session_cache = None;

        let tls = match settings.role {
            ServiceRole::Initiator => {
                let name = settings.server_name().unwrap_or_default();
                let mut builder = TlsClientConfig::new(name);
                if let Some(versions) = tls_settings.tls_versions() {
                    builder = builder.with_tls_versions(versions);
                }
                if let Some(ca) = &tls_settings.ca_path {
                    builder = builder.with_ca_file(ca.clone());
                }
                if let (Some(cert), Some(key)) = (&tls_settings.cert_path, &tls_settings.key_path) {
                    builder = builder.with_client_certificate(cert.clone(), key.clone());
                }
                if let Some(pin) = &tls_settings.pinned_sha256 {
                    builder = builder.with_pinned_cert_hash(parse_pin(pin)?);
                }
                if tls_settings.insecure {
                    builder = builder.insecure();
                }
                TlsRole::Client {
                    config: Arc::new(builder.load_client_config()?),
                    server_name: builder.server_name()?,
                }
            }
            ServiceRole::Responder => {
                let cert = tls_settings.cert_path.clone().unwrap_or_default();
                let key = tls_settings.key_path.clone().unwrap_or_default();
                let mut builder = TlsServerConfig::new(cert, key);
                if let Some(versions) = tls_settings.tls_versions() {
                    builder = builder.with_tls_versions(versions);
                }
                if let Some(ca) = &tls_settings.ca_path {
                    builder = builder
                        .with_client_auth(ca.clone())
                        .require_client_auth(tls_settings.verify_peer);
                }
                if tls_settings.session_cache_size > 0 {
                    let cache = Arc::new(SessionCache::new(
                        tls_settings.session_cache_size,
                        tls_settings.session_cache_ttl,
                    ));
                    builder = builder.with_session_cache(cache.clone());
                    session_cache = Some(cache);
                }
                TlsRole::Server {
                    config: Arc::new(builder.load_server_config()?),
                }
            }
        };

        debug!(service = %settings.name, role = ?settings.role, "Service TLS context ready");
        Ok(Self {
            settings: settings.clone(),
            tls,
            session_cache,
        })
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn role(&self) -> ServiceRole {
        self.settings.role
    }

    pub fn settings(&self) -> &ServiceConfig {
        &self.settings
    }

    /// Responder that dials out instead of listening
    pub fn is_call_home(&self) -> bool {
        self.settings.call_home.is_some()
    }

    pub fn tls_role(&self) -> &TlsRole {
        &self.tls
    }

    pub fn session_cache(&self) -> Option<&SessionCache> {
        self.session_cache.as_deref()
    }

    /// Start a TLS session of this service's role over `sock`
    pub fn open_session(&self, sock: TcpStream) -> Result<TlsSession> {
        match &self.tls {
            TlsRole::Client {
                config,
                server_name,
            } => TlsSession::client(config.clone(), server_name.clone(), sock),
            TlsRole::Server { config } => TlsSession::server(config.clone(), sock),
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.settings.name)
            .field("role", &self.settings.role)
            .field("call_home", &self.settings.call_home)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsSettings;

    fn write_cert(tag: &str) -> (String, String) {
        let dir = std::env::temp_dir().join(format!("usc-tunnel-svc-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("dir");
        let certified =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).expect("cert");
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        std::fs::write(&cert, certified.cert.pem()).expect("write cert");
        std::fs::write(&key, certified.key_pair.serialize_pem()).expect("write key");
        (
            cert.to_string_lossy().into_owned(),
            key.to_string_lossy().into_owned(),
        )
    }

    #[test]
    fn test_responder_builds_server_context_with_cache() {
        let (cert, key) = write_cert("responder");
        let settings = ServiceConfig {
            name: "resp".into(),
            role: ServiceRole::Responder,
            accept: Some("127.0.0.1:0".into()),
            connect: vec!["127.0.0.1:830".into()],
            tls: TlsSettings {
                cert_path: Some(cert),
                key_path: Some(key),
                ..TlsSettings::default()
            },
            ..ServiceConfig::default()
        };
        let service = Service::from_config(&settings).expect("service");
        assert!(matches!(service.tls_role(), TlsRole::Server { .. }));
        assert!(service.session_cache().is_some());
        assert!(!service.is_call_home());
    }

    #[test]
    fn test_initiator_with_pin_builds_client_context() {
        let settings = ServiceConfig {
            name: "init".into(),
            role: ServiceRole::Initiator,
            accept: Some("127.0.0.1:0".into()),
            connect: vec!["127.0.0.1:6513".into()],
            tls: TlsSettings {
                pinned_sha256: Some("00".repeat(32)),
                ..TlsSettings::default()
            },
            ..ServiceConfig::default()
        };
        let service = Service::from_config(&settings).expect("service");
        assert!(matches!(service.tls_role(), TlsRole::Client { .. }));
    }

    #[test]
    fn test_missing_certificate_fails() {
        let settings = ServiceConfig {
            role: ServiceRole::Responder,
            tls: TlsSettings {
                cert_path: Some("/nonexistent/cert.pem".into()),
                key_path: Some("/nonexistent/key.pem".into()),
                ..TlsSettings::default()
            },
            ..ServiceConfig::default()
        };
        assert!(Service::from_config(&settings).is_err());
    }
}
