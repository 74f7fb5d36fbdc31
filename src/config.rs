//! Configuration model.
//!
//! The surrounding daemon owns config files and live reconfiguration; the
//! engine consumes these structs. The `parse_server_args` / `parse_verbs`
//! helpers accept the historical `key=value` word lists so existing
//! `backend-server` and `feature` directives carry over unchanged.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown backend option {0}")]
    UnknownBackendOption(String),
    #[error("unknown feature {0}")]
    UnknownFeature(String),
    #[error("invalid value for {option}: {value}")]
    InvalidValue { option: String, value: String },
    #[error("backend uri {0} is not a valid ldap:// or ldaps:// uri")]
    InvalidUri(String),
    #[error("a backend needs at least one regular and one bind connection")]
    EmptyPool,
    #[error("{0} cannot be changed at runtime")]
    ImmutableAtRuntime(&'static str),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsMode {
    #[default]
    Off,
    /// TLS from the first byte (ldaps://).
    Ldaps,
    /// Plain connect followed by the StartTLS exop.
    StartTls,
    /// StartTls, but failure to negotiate is tolerated.
    StartTlsOptional,
}

/// Global feature toggles, the `feature` directive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    /// Translate client binds into VerifyCredentials exops on the general
    /// pool instead of dedicating bind connections.
    pub vc: bool,
    /// Learn each client's authenticated identity and forward requests under
    /// it with a proxy authorization control.
    pub proxyauthz: bool,
    /// Engage read-side backpressure on clients when too many operations are
    /// in flight.
    pub read_pause: bool,
}

impl Features {
    pub fn parse_verbs(words: &[&str]) -> Result<Features, ConfigError> {
        let mut features = Features::default();
        for word in words {
            match *word {
                "vc" => features.vc = true,
                "proxyauthz" => features.proxyauthz = true,
                "read_pause" => features.read_pause = true,
                other => return Err(ConfigError::UnknownFeature(other.to_string())),
            }
        }
        Ok(features)
    }
}

/// How the proxy authenticates its own upstream sessions (`bindconf`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindMethod {
    /// Anonymous session, no bind issued beyond protocol establishment.
    None,
    Simple {
        binddn: String,
        credentials: String,
    },
    Sasl {
        mechanism: String,
        authcid: Option<String>,
        authzid: Option<String>,
        credentials: Option<String>,
    },
}

impl Default for BindMethod {
    fn default() -> Self {
        BindMethod::None
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindConf {
    pub method: BindMethod,
    /// Identity requests are forwarded under when `proxyauthz` is off;
    /// when unset the identity has to be learned with Who Am I.
    pub authz_identity: Option<String>,
}

impl BindConf {
    /// Whether the authenticated identity of a client SASL bind can be
    /// inferred without asking the backend.
    pub fn identity_inferable(&self) -> bool {
        self.authz_identity.is_some()
    }

    /// Parse one `bindconf` directive:
    /// `bindmethod=none|simple|sasl binddn=DN credentials=PW saslmech=MECH
    ///  authcid=ID authzid=ID`.
    pub fn parse_args(words: &[&str]) -> Result<BindConf, ConfigError> {
        let mut method = None;
        let mut binddn = None;
        let mut credentials = None;
        let mut saslmech = None;
        let mut authcid = None;
        let mut authzid = None;
        for word in words {
            let (key, value) = word
                .split_once('=')
                .ok_or_else(|| ConfigError::UnknownBackendOption(word.to_string()))?;
            match key {
                "bindmethod" => method = Some(value.to_string()),
                "binddn" => binddn = Some(value.to_string()),
                "credentials" => credentials = Some(value.to_string()),
                "saslmech" => saslmech = Some(value.to_string()),
                "authcid" => authcid = Some(value.to_string()),
                "authzid" => authzid = Some(value.to_string()),
                _ => return Err(ConfigError::UnknownBackendOption(key.to_string())),
            }
        }
        let invalid = |option: &str, value: &str| ConfigError::InvalidValue {
            option: option.to_string(),
            value: value.to_string(),
        };
        let method = match method.as_deref() {
            None | Some("none") => BindMethod::None,
            Some("simple") => BindMethod::Simple {
                binddn: binddn.clone().ok_or_else(|| invalid("binddn", ""))?,
                credentials: credentials.ok_or_else(|| invalid("credentials", ""))?,
            },
            Some("sasl") => BindMethod::Sasl {
                mechanism: saslmech.ok_or_else(|| invalid("saslmech", ""))?,
                authcid,
                authzid: authzid.clone(),
                credentials,
            },
            Some(other) => return Err(invalid("bindmethod", other)),
        };
        // the session identity doubles as the forwarded authorization identity
        let authz_identity = match &method {
            BindMethod::Simple { binddn, .. } => Some(binddn.clone()),
            BindMethod::Sasl { authzid, .. } => authzid.clone(),
            BindMethod::None => None,
        };
        Ok(BindConf {
            method,
            authz_identity,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub uri: String,
    pub host: String,
    pub port: u16,
    pub tls: TlsMode,
    /// Target size of the general pool (`numconns=`).
    pub numconns: usize,
    /// Target size of the bind pool (`bindconns=`).
    pub bindconns: usize,
    /// Base delay between reconnection attempts (`retry=`, milliseconds).
    pub retry_ms: u64,
    /// Cap on operations in flight across the whole backend
    /// (`max-pending-ops=`, 0 = unlimited).
    pub max_pending_ops: usize,
    /// Cap on operations in flight on one connection (`conn-max-pending=`,
    /// 0 = unlimited).
    pub conn_max_pending: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            uri: String::new(),
            host: String::new(),
            port: 389,
            tls: TlsMode::Off,
            numconns: 1,
            bindconns: 1,
            retry_ms: 5000,
            max_pending_ops: 0,
            conn_max_pending: 0,
        }
    }
}

impl BackendConfig {
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_ms)
    }

    /// Parse one `backend-server` directive:
    /// `uri=ldap://host:port numconns=N bindconns=N retry=MS
    ///  max-pending-ops=N conn-max-pending=N starttls=yes|critical|no`.
    pub fn parse_server_args(words: &[&str]) -> Result<BackendConfig, ConfigError> {
        let mut config = BackendConfig::default();
        for word in words {
            let (key, value) = word
                .split_once('=')
                .ok_or_else(|| ConfigError::UnknownBackendOption(word.to_string()))?;
            let invalid = || ConfigError::InvalidValue {
                option: key.to_string(),
                value: value.to_string(),
            };
            match key {
                "uri" => config.set_uri(value)?,
                "numconns" => config.numconns = value.parse().map_err(|_| invalid())?,
                "bindconns" => config.bindconns = value.parse().map_err(|_| invalid())?,
                "retry" => config.retry_ms = value.parse().map_err(|_| invalid())?,
                "max-pending-ops" => {
                    config.max_pending_ops = value.parse().map_err(|_| invalid())?
                }
                "conn-max-pending" => {
                    config.conn_max_pending = value.parse().map_err(|_| invalid())?
                }
                "starttls" => {
                    // ldaps:// already takes precedence over starttls=
                    if config.tls != TlsMode::Ldaps {
                        config.tls = match value {
                            "no" => TlsMode::Off,
                            "yes" => TlsMode::StartTlsOptional,
                            "critical" => TlsMode::StartTls,
                            _ => return Err(invalid()),
                        };
                    }
                }
                _ => return Err(ConfigError::UnknownBackendOption(key.to_string())),
            }
        }
        if config.uri.is_empty() {
            return Err(ConfigError::InvalidUri(String::new()));
        }
        if config.numconns == 0 || config.bindconns == 0 {
            return Err(ConfigError::EmptyPool);
        }
        Ok(config)
    }

    fn set_uri(&mut self, uri: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidUri(uri.to_string());
        let (scheme, rest) = uri.split_once("://").ok_or_else(invalid)?;
        let default_port = match scheme {
            "ldap" => 389,
            "ldaps" => {
                self.tls = TlsMode::Ldaps;
                636
            }
            _ => return Err(invalid()),
        };
        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
            None => (rest, default_port),
        };
        if host.is_empty() {
            return Err(invalid());
        }
        self.uri = uri.to_string();
        self.host = host.to_string();
        self.port = port;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub backends: Vec<BackendConfig>,
    pub bindconf: BindConf,
    pub features: Features,
    /// Operations a single client may keep pending (`client_max_pending`,
    /// 0 = unlimited).
    pub client_max_pending: usize,
    /// PDUs one worker task handles before re-queuing the connection
    /// (`max_pdus_per_cycle`).
    pub max_pdus_per_cycle: usize,
    /// Age threshold for the operation timeout sweep (`iotimeout`,
    /// milliseconds, 0 = disabled).
    pub iotimeout_ms: u64,
    /// How long a connection may sit with unflushed output before it is torn
    /// down (`writetimeout`, milliseconds).
    pub write_timeout_ms: u64,
    /// Largest client PDU accepted before the connection is killed.
    pub sockbuf_max_client: usize,
    /// Largest upstream PDU accepted.
    pub sockbuf_max_upstream: usize,
    /// Global in-flight operation count above which `read_pause` mutes
    /// client reads.
    pub read_pause_threshold: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            backends: Vec::new(),
            bindconf: BindConf::default(),
            features: Features::default(),
            client_max_pending: 0,
            max_pdus_per_cycle: 10,
            iotimeout_ms: 0,
            write_timeout_ms: 10_000,
            sockbuf_max_client: 256 * 1024,
            sockbuf_max_upstream: 16 * 1024 * 1024,
            read_pause_threshold: 16 * 1024,
        }
    }
}

impl ProxyConfig {
    pub fn iotimeout(&self) -> Option<Duration> {
        (self.iotimeout_ms > 0).then(|| Duration::from_millis(self.iotimeout_ms))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_server_directive() {
        let config = BackendConfig::parse_server_args(&[
            "uri=ldap://ldap1.example.com:10389",
            "numconns=4",
            "bindconns=2",
            "retry=2000",
            "max-pending-ops=64",
            "conn-max-pending=8",
        ])
        .expect("parse");
        assert_eq!(config.host, "ldap1.example.com");
        assert_eq!(config.port, 10389);
        assert_eq!(config.numconns, 4);
        assert_eq!(config.bindconns, 2);
        assert_eq!(config.retry_timeout(), Duration::from_secs(2));
        assert_eq!(config.max_pending_ops, 64);
        assert_eq!(config.conn_max_pending, 8);
    }

    #[test]
    fn ldaps_uri_overrides_starttls() {
        let config =
            BackendConfig::parse_server_args(&["uri=ldaps://ldap1.example.com", "starttls=yes"])
                .expect("parse");
        assert_eq!(config.tls, TlsMode::Ldaps);
        assert_eq!(config.port, 636);
    }

    #[test]
    fn defaults_match_historical_ones() {
        let config = BackendConfig::parse_server_args(&["uri=ldap://h"]).expect("parse");
        assert_eq!(config.numconns, 1);
        assert_eq!(config.bindconns, 1);
        assert_eq!(config.retry_ms, 5000);
    }

    #[test]
    fn zero_sized_pools_rejected() {
        let err = BackendConfig::parse_server_args(&["uri=ldap://h", "numconns=0"]).unwrap_err();
        assert_eq!(err, ConfigError::EmptyPool);
    }

    #[test]
    fn bindconf_directive() {
        let conf = BindConf::parse_args(&[
            "bindmethod=simple",
            "binddn=cn=proxy,dc=example,dc=com",
            "credentials=secret",
        ])
        .expect("parse");
        assert!(conf.identity_inferable());
        assert_eq!(
            conf.method,
            BindMethod::Simple {
                binddn: "cn=proxy,dc=example,dc=com".to_string(),
                credentials: "secret".to_string(),
            }
        );

        let sasl = BindConf::parse_args(&[
            "bindmethod=sasl",
            "saslmech=PLAIN",
            "authcid=proxy",
            "credentials=sekrit",
        ])
        .expect("parse");
        assert!(!sasl.identity_inferable());
        assert_eq!(
            sasl.method,
            BindMethod::Sasl {
                mechanism: "PLAIN".to_string(),
                authcid: Some("proxy".to_string()),
                authzid: None,
                credentials: Some("sekrit".to_string()),
            }
        );

        assert!(BindConf::parse_args(&["bindmethod=simple"]).is_err());
    }

    #[test]
    fn feature_verbs() {
        let features = Features::parse_verbs(&["proxyauthz", "read_pause"]).expect("parse");
        assert!(features.proxyauthz);
        assert!(features.read_pause);
        assert!(!features.vc);

        assert!(matches!(
            Features::parse_verbs(&["telepathy"]),
            Err(ConfigError::UnknownFeature(_))
        ));
    }
}
