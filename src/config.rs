// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Configuration is read from the environment once at startup into a
//! [`SignerConfig`]. Invalid values fail startup with a [`ConfigError`]
//! naming the offending variable.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `MASTER_KEY_SEED` | Hex master seed | Required unless `MASTER_KEY_SEED_FILE` |
//! | `MASTER_KEY_SEED_FILE` | File holding raw seed bytes (Gramine secret) | - |
//! | `KEY_ROTATION_PERIOD` | Rotation period (`30d`, `12h`, `90m`, `45s`, `500ms`, seconds) | `30d` |
//! | `KEY_OVERLAP_PERIOD` | Overlap window after rotation | `7d` |
//! | `KEY_REFRESH_INTERVAL` | Repository poll interval | `60s` |
//! | `KEY_STORE` | `none`, `redb` or `postgrest` | `redb` |
//! | `KEY_STORE_PATH` | redb file | `/data/keys/key_versions.redb` |
//! | `KEY_STORE_URL` | PostgREST base URL | Required for `postgrest` |
//! | `KEY_STORE_API_KEY` | PostgREST service key | Optional |
//! | `KEY_STORE_TIMEOUT` | Per-call repository deadline | `5s` |
//! | `REQUIRE_REPOSITORY` | Refuse to run without the repository | `true` |
//! | `REQUIRE_ANCHOR` | Rotation must anchor on-chain | `false` |
//! | `ANCHOR_MODE` | `local` or `evm` | `local` |
//! | `ANCHOR_RPC_URL` | EVM JSON-RPC endpoint | Required for `evm` |
//! | `ANCHOR_CONTRACT` | Trust anchor contract address | Required for `evm` |
//! | `ANCHOR_TX_KEY` | PEM file with the transaction-paying key | Required for `evm` |
//! | `RATE_LIMIT_RPS` | Per-client sustained rate | `100` |
//! | `RATE_LIMIT_BURST` | Per-client burst | `100` |
//! | `AUDIT_SINK` | `none`, `file` or `postgrest` | `file` |
//! | `AUDIT_DIR` | JSONL audit directory | `/data/audit` |
//! | `AUDIT_QUEUE_CAPACITY` | Bounded audit queue | `1024` |
//! | `AUDIT_BACKOFF_INITIAL` | First retry delay | `100ms` |
//! | `AUDIT_BACKOFF_MAX` | Retry delay cap | `10s` |
//! | `AUDIT_MAX_ATTEMPTS` | Attempts before a record is dropped | `8` |
//! | `ADMIN_ENABLED` | Mount `/admin` | `false` |
//! | `ADMIN_IDENTITIES` | Comma-separated operator certificate fingerprints | empty |
//! | `ATTESTATION_MODE` | `gramine`, `simulated` or `off` | `gramine` if `/dev/attestation` exists |
//! | `TLS_CERT_PATH` / `TLS_KEY_PATH` | Server certificate chain and key | Required |
//! | `TLS_CLIENT_CA_PATH` | CA for client certificates | Optional |
//! | `HOST` / `PORT` | Bind address | `0.0.0.0` / `8443` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use alloy::primitives::Address;

use crate::audit::BackoffPolicy;
use crate::keys::{GramineAttestor, KeyError, KeyManagerConfig, MasterSeed};
use crate::ratelimit::RateLimitConfig;
use crate::state::AdminConfig;
use crate::tls::TlsPaths;

/// Environment variable name for the hex-encoded master seed.
pub const MASTER_KEY_SEED_ENV: &str = "MASTER_KEY_SEED";

/// Environment variable name for the master seed file.
///
/// Under Gramine this points at a file provisioned through
/// `sgx.remote_secrets` or the encrypted mount.
pub const MASTER_KEY_SEED_FILE_ENV: &str = "MASTER_KEY_SEED_FILE";

pub const DEFAULT_KEY_STORE_PATH: &str = "/data/keys/key_versions.redb";
pub const DEFAULT_AUDIT_DIR: &str = "/data/audit";
pub const DEFAULT_PORT: u16 = 8443;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{var} is invalid: {message}")]
    Invalid { var: &'static str, message: String },

    #[error("master seed: {0}")]
    Seed(#[from] KeyError),

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn invalid(var: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        message: message.into(),
    }
}

/// Where the master seed comes from.
#[derive(Clone)]
pub enum SeedSource {
    Hex(String),
    File(PathBuf),
}

impl std::fmt::Debug for SeedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeedSource::Hex(_) => f.write_str("Hex(<redacted>)"),
            SeedSource::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

impl SeedSource {
    pub fn load(&self) -> Result<MasterSeed, ConfigError> {
        match self {
            SeedSource::Hex(encoded) => Ok(MasterSeed::from_hex(encoded)?),
            SeedSource::File(path) => {
                let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                Ok(MasterSeed::new(bytes)?)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStoreConfig {
    None,
    Redb { path: PathBuf },
    Postgrest { url: String, api_key: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorConfig {
    /// In-process verifier.
    Local,
    Evm {
        rpc_url: String,
        contract: Address,
        tx_key_path: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditSinkConfig {
    None,
    File { dir: PathBuf },
    /// Writes to the key store's PostgREST endpoint.
    Postgrest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttestationMode {
    Gramine,
    Simulated,
    Off,
}

#[derive(Debug, Clone)]
pub struct SignerConfig {
    pub seed: SeedSource,
    pub keys: KeyManagerConfig,
    pub refresh_interval: Duration,
    pub key_store: KeyStoreConfig,
    pub anchor: AnchorConfig,
    pub rate_limit: RateLimitConfig,
    pub audit: AuditSinkConfig,
    pub audit_queue_capacity: usize,
    pub audit_backoff: BackoffPolicy,
    pub admin: AdminConfig,
    pub attestation: AttestationMode,
    pub tls: Option<TlsPaths>,
    pub bind: SocketAddr,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            seed: SeedSource::Hex(String::new()),
            keys: KeyManagerConfig::default(),
            refresh_interval: crate::keys::scheduler::DEFAULT_REFRESH_INTERVAL,
            key_store: KeyStoreConfig::Redb {
                path: PathBuf::from(DEFAULT_KEY_STORE_PATH),
            },
            anchor: AnchorConfig::Local,
            rate_limit: RateLimitConfig::default(),
            audit: AuditSinkConfig::File {
                dir: PathBuf::from(DEFAULT_AUDIT_DIR),
            },
            audit_queue_capacity: 1024,
            audit_backoff: BackoffPolicy::default(),
            admin: AdminConfig::default(),
            attestation: AttestationMode::Simulated,
            tls: None,
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
        }
    }
}

impl SignerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let defaults = Self::default();

        let seed = match (env.get(MASTER_KEY_SEED_ENV), env.get(MASTER_KEY_SEED_FILE_ENV)) {
            (Some(hex), _) => SeedSource::Hex(hex),
            (None, Some(path)) => SeedSource::File(PathBuf::from(path)),
            (None, None) => return Err(ConfigError::Missing(MASTER_KEY_SEED_ENV)),
        };

        let keys = KeyManagerConfig {
            rotation_period: env.period("KEY_ROTATION_PERIOD", defaults.keys.rotation_period)?,
            overlap_period: env.period("KEY_OVERLAP_PERIOD", defaults.keys.overlap_period)?,
            require_repository: env.flag("REQUIRE_REPOSITORY", defaults.keys.require_repository)?,
            require_anchor: env.flag("REQUIRE_ANCHOR", defaults.keys.require_anchor)?,
            store_timeout: env.duration("KEY_STORE_TIMEOUT", defaults.keys.store_timeout)?,
        };
        if keys.rotation_period <= chrono::Duration::zero() {
            return Err(invalid("KEY_ROTATION_PERIOD", "must be greater than zero"));
        }

        let key_store = match env.get("KEY_STORE").as_deref().unwrap_or("redb") {
            "none" => KeyStoreConfig::None,
            "redb" => KeyStoreConfig::Redb {
                path: env
                    .get("KEY_STORE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_STORE_PATH)),
            },
            "postgrest" => KeyStoreConfig::Postgrest {
                url: env.require("KEY_STORE_URL")?,
                api_key: env.get("KEY_STORE_API_KEY"),
            },
            other => return Err(invalid("KEY_STORE", format!("unknown backend `{other}`"))),
        };

        let anchor = match env.get("ANCHOR_MODE").as_deref().unwrap_or("local") {
            "local" => AnchorConfig::Local,
            "evm" => AnchorConfig::Evm {
                rpc_url: env.require("ANCHOR_RPC_URL")?,
                contract: env
                    .require("ANCHOR_CONTRACT")?
                    .parse()
                    .map_err(|e| invalid("ANCHOR_CONTRACT", format!("{e}")))?,
                tx_key_path: PathBuf::from(env.require("ANCHOR_TX_KEY")?),
            },
            other => return Err(invalid("ANCHOR_MODE", format!("unknown mode `{other}`"))),
        };

        let rate_limit = RateLimitConfig {
            rate_per_sec: env.parse("RATE_LIMIT_RPS", defaults.rate_limit.rate_per_sec)?,
            burst: env.parse("RATE_LIMIT_BURST", defaults.rate_limit.burst)?,
        };
        if rate_limit.rate_per_sec.is_nan() || rate_limit.rate_per_sec <= 0.0 {
            return Err(invalid("RATE_LIMIT_RPS", "must be greater than zero"));
        }
        if rate_limit.burst == 0 {
            return Err(invalid("RATE_LIMIT_BURST", "must be greater than zero"));
        }

        let audit = match env.get("AUDIT_SINK").as_deref().unwrap_or("file") {
            "none" => AuditSinkConfig::None,
            "file" => AuditSinkConfig::File {
                dir: env
                    .get("AUDIT_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_AUDIT_DIR)),
            },
            "postgrest" => {
                if !matches!(key_store, KeyStoreConfig::Postgrest { .. }) {
                    return Err(invalid("AUDIT_SINK", "postgrest requires KEY_STORE=postgrest"));
                }
                AuditSinkConfig::Postgrest
            }
            other => return Err(invalid("AUDIT_SINK", format!("unknown sink `{other}`"))),
        };

        let audit_backoff = BackoffPolicy {
            initial: env.duration("AUDIT_BACKOFF_INITIAL", defaults.audit_backoff.initial)?,
            max: env.duration("AUDIT_BACKOFF_MAX", defaults.audit_backoff.max)?,
            max_attempts: env.parse("AUDIT_MAX_ATTEMPTS", defaults.audit_backoff.max_attempts)?,
        };

        let admin = AdminConfig {
            enabled: env.flag("ADMIN_ENABLED", false)?,
            identities: env
                .get("ADMIN_IDENTITIES")
                .map(|raw| parse_identities(&raw))
                .unwrap_or_default(),
        };

        let attestation = match env.get("ATTESTATION_MODE").as_deref() {
            None if GramineAttestor::new().is_available() => AttestationMode::Gramine,
            None => AttestationMode::Simulated,
            Some("gramine") => AttestationMode::Gramine,
            Some("simulated") => AttestationMode::Simulated,
            Some("off") => AttestationMode::Off,
            Some(other) => {
                return Err(invalid("ATTESTATION_MODE", format!("unknown mode `{other}`")))
            }
        };

        let tls = match (env.get("TLS_CERT_PATH"), env.get("TLS_KEY_PATH")) {
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: PathBuf::from(cert),
                key: PathBuf::from(key),
                client_ca: env.get("TLS_CLIENT_CA_PATH").map(PathBuf::from),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("TLS_KEY_PATH")),
            (None, Some(_)) => return Err(ConfigError::Missing("TLS_CERT_PATH")),
        };

        let host = env.get("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = env.parse("PORT", DEFAULT_PORT)?;
        let bind = format!("{host}:{port}")
            .parse()
            .map_err(|e| invalid("HOST", format!("{e}")))?;

        Ok(Self {
            seed,
            keys,
            refresh_interval: env.duration("KEY_REFRESH_INTERVAL", defaults.refresh_interval)?,
            key_store,
            anchor,
            rate_limit,
            audit,
            audit_queue_capacity: env.parse("AUDIT_QUEUE_CAPACITY", defaults.audit_queue_capacity)?,
            audit_backoff,
            admin,
            attestation,
            tls,
            bind,
        })
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, var: &'static str) -> Result<String, ConfigError> {
        self.get(var).ok_or(ConfigError::Missing(var))
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e| invalid(var, format!("{e}"))),
        }
    }

    fn flag(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(var).map(|v| v.to_ascii_lowercase()).as_deref() {
            None => Ok(default),
            Some("true" | "1" | "yes" | "on") => Ok(true),
            Some("false" | "0" | "no" | "off") => Ok(false),
            Some(other) => Err(invalid(var, format!("expected a boolean, got `{other}`"))),
        }
    }

    fn duration(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        match self.get(var) {
            None => Ok(default),
            Some(raw) => parse_duration(&raw).map_err(|message| invalid(var, message)),
        }
    }

    fn period(
        &self,
        var: &'static str,
        default: chrono::Duration,
    ) -> Result<chrono::Duration, ConfigError> {
        match self.get(var) {
            None => Ok(default),
            Some(raw) => {
                let parsed = parse_duration(&raw).map_err(|message| invalid(var, message))?;
                chrono::Duration::from_std(parsed).map_err(|e| invalid(var, format!("{e}")))
            }
        }
    }
}

/// Parse `30d`, `12h`, `90m`, `45s`, `250ms`, or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("`{raw}` is not a duration"))?;

    let seconds_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(value)),
        "" | "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        other => return Err(format!("unknown unit `{other}` in `{raw}`")),
    };
    value
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("`{raw}` is too large"))
}

fn parse_identities(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|id| id.trim().to_ascii_lowercase())
        .filter(|id| !id.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SEED: &str = "5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a";

    fn config(vars: &[(&str, &str)]) -> Result<SignerConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SignerConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn durations_accept_units_and_bare_seconds() {
        assert_eq!(parse_duration("30d").unwrap(), Duration::from_secs(30 * 86_400));
        assert_eq!(parse_duration("12h").unwrap(), Duration::from_secs(43_200));
        assert_eq!(parse_duration("90m").unwrap(), Duration::from_secs(5_400));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
        assert!(parse_duration("ten").is_err());
        assert!(parse_duration("5w").is_err());
    }

    #[test]
    fn defaults_apply_when_only_seed_is_set() {
        let cfg = config(&[(MASTER_KEY_SEED_ENV, SEED), ("ATTESTATION_MODE", "off")]).unwrap();

        assert_eq!(cfg.keys.rotation_period, chrono::Duration::days(30));
        assert_eq!(cfg.keys.overlap_period, chrono::Duration::days(7));
        assert!(cfg.keys.require_repository);
        assert!(!cfg.keys.require_anchor);
        assert_eq!(
            cfg.key_store,
            KeyStoreConfig::Redb {
                path: PathBuf::from(DEFAULT_KEY_STORE_PATH)
            }
        );
        assert_eq!(cfg.anchor, AnchorConfig::Local);
        assert_eq!(cfg.rate_limit.burst, 100);
        assert_eq!(cfg.audit_queue_capacity, 1024);
        assert!(!cfg.admin.enabled);
        assert_eq!(cfg.attestation, AttestationMode::Off);
        assert!(cfg.tls.is_none());
        assert_eq!(cfg.bind.port(), DEFAULT_PORT);
        assert!(cfg.seed.load().is_ok());
    }

    #[test]
    fn missing_seed_is_reported() {
        let err = config(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(MASTER_KEY_SEED_ENV)));
    }

    #[test]
    fn seed_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed");
        std::fs::write(&path, [7u8; 32]).unwrap();

        let cfg = config(&[(MASTER_KEY_SEED_FILE_ENV, path.to_str().unwrap())]).unwrap();
        assert!(matches!(cfg.seed, SeedSource::File(_)));
        assert!(cfg.seed.load().is_ok());
    }

    #[test]
    fn short_seed_is_rejected_on_load() {
        let cfg = config(&[(MASTER_KEY_SEED_ENV, "abcd")]).unwrap();
        assert!(matches!(cfg.seed.load(), Err(ConfigError::Seed(_))));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = config(&[(MASTER_KEY_SEED_ENV, SEED), ("KEY_OVERLAP_PERIOD", "soon")]).unwrap_err();
        assert!(err.to_string().starts_with("KEY_OVERLAP_PERIOD"));

        let err = config(&[(MASTER_KEY_SEED_ENV, SEED), ("REQUIRE_REPOSITORY", "maybe")]).unwrap_err();
        assert!(err.to_string().starts_with("REQUIRE_REPOSITORY"));

        let err = config(&[(MASTER_KEY_SEED_ENV, SEED), ("KEY_STORE", "sqlite")]).unwrap_err();
        assert!(err.to_string().starts_with("KEY_STORE"));

        let err = config(&[(MASTER_KEY_SEED_ENV, SEED), ("RATE_LIMIT_RPS", "0")]).unwrap_err();
        assert!(err.to_string().starts_with("RATE_LIMIT_RPS"));
    }

    #[test]
    fn postgrest_and_evm_require_their_settings() {
        let err = config(&[(MASTER_KEY_SEED_ENV, SEED), ("KEY_STORE", "postgrest")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("KEY_STORE_URL")));

        let err = config(&[(MASTER_KEY_SEED_ENV, SEED), ("ANCHOR_MODE", "evm")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("ANCHOR_RPC_URL")));

        let cfg = config(&[
            (MASTER_KEY_SEED_ENV, SEED),
            ("ANCHOR_MODE", "evm"),
            ("ANCHOR_RPC_URL", "http://localhost:8545"),
            ("ANCHOR_CONTRACT", "0x5FbDB2315678afecb367f032d93F642f64180aa3"),
            ("ANCHOR_TX_KEY", "/secrets/anchor.pem"),
        ])
        .unwrap();
        assert!(matches!(cfg.anchor, AnchorConfig::Evm { .. }));
    }

    #[test]
    fn audit_postgrest_needs_postgrest_store() {
        let err = config(&[(MASTER_KEY_SEED_ENV, SEED), ("AUDIT_SINK", "postgrest")]).unwrap_err();
        assert!(err.to_string().starts_with("AUDIT_SINK"));

        let cfg = config(&[
            (MASTER_KEY_SEED_ENV, SEED),
            ("KEY_STORE", "postgrest"),
            ("KEY_STORE_URL", "https://db.example.com/rest/v1"),
            ("AUDIT_SINK", "postgrest"),
        ])
        .unwrap();
        assert_eq!(cfg.audit, AuditSinkConfig::Postgrest);
    }

    #[test]
    fn admin_identities_are_normalized() {
        let cfg = config(&[
            (MASTER_KEY_SEED_ENV, SEED),
            ("ADMIN_ENABLED", "true"),
            ("ADMIN_IDENTITIES", " ABCD , ef01,,"),
        ])
        .unwrap();
        assert!(cfg.admin.enabled);
        assert!(cfg.admin.allows("abcd"));
        assert!(cfg.admin.allows("ef01"));
        assert_eq!(cfg.admin.identities.len(), 2);
    }

    #[test]
    fn tls_paths_must_come_in_pairs() {
        let err = config(&[(MASTER_KEY_SEED_ENV, SEED), ("TLS_CERT_PATH", "/tls/cert.pem")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("TLS_KEY_PATH")));
    }
}
