// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::{sync::Arc, time::Duration};

use relational_tee_signer::{
    anchor::{caller_address, submitter::signer_from_pem, AnchorVerifier, EvmAnchorSubmitter, LocalAnchorSubmitter},
    api::router,
    audit::{AuditBackend, AuditSink, JsonlAuditBackend, PostgrestAuditBackend},
    config::{AnchorConfig, AttestationMode, AuditSinkConfig, KeyStoreConfig, SignerConfig},
    endpoint::SigningEndpoint,
    keys::{Attestor, GramineAttestor, KeyMaintenance, KeyManager, SimulatedAttestor},
    ratelimit::ClientRateLimiter,
    state::AppState,
    storage::{KeyVersionStore, PostgrestConfig, PostgrestKeyVersionStore, RedbKeyVersionStore},
    tls::{server_config, PeerIdentityAcceptor},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EVM_RECEIPT_TIMEOUT: Duration = Duration::from_secs(120);
const AUDIT_DRAIN_DEADLINE: Duration = Duration::from_secs(5);
const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(10);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => builder.json().init(),
        _ => builder.init(),
    }
}

/// Log and exit. Startup failures are fatal.
fn fatal(context: &str, error: impl std::fmt::Display) -> ! {
    error!(error = %error, "{context}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    init_tracing();

    // Install the ring crypto provider for rustls (must be done before any TLS operations)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = SignerConfig::from_env().unwrap_or_else(|e| fatal("Invalid configuration", e));
    let seed = config
        .seed
        .load()
        .unwrap_or_else(|e| fatal("Failed to load master seed", e));

    let postgrest = match &config.key_store {
        KeyStoreConfig::Postgrest { url, api_key } => Some(PostgrestConfig {
            url: url.clone(),
            api_key: api_key.clone(),
            timeout: config.keys.store_timeout,
        }),
        _ => None,
    };

    let store: Option<Arc<dyn KeyVersionStore>> = match &config.key_store {
        KeyStoreConfig::None => None,
        KeyStoreConfig::Redb { path } => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .unwrap_or_else(|e| fatal("Failed to create key store directory", e));
            }
            let store = RedbKeyVersionStore::open(path)
                .unwrap_or_else(|e| fatal("Failed to open key store", e));
            Some(Arc::new(store))
        }
        KeyStoreConfig::Postgrest { .. } => {
            let pg = postgrest.as_ref().unwrap_or_else(|| fatal("Key store", "missing PostgREST settings"));
            let store = PostgrestKeyVersionStore::new(pg)
                .unwrap_or_else(|e| fatal("Failed to build key store client", e));
            Some(Arc::new(store))
        }
    };

    let attestor: Option<Arc<dyn Attestor>> = match config.attestation {
        AttestationMode::Gramine => {
            let attestor = GramineAttestor::new();
            if !attestor.is_available() {
                warn!("ATTESTATION_MODE=gramine but /dev/attestation is missing; rotations will fail to attest");
            }
            Some(Arc::new(attestor))
        }
        AttestationMode::Simulated => {
            warn!("Using simulated attestation (not for production)");
            Some(Arc::new(SimulatedAttestor::new()))
        }
        AttestationMode::Off => None,
    };

    let shutdown = CancellationToken::new();

    let mut keys = KeyManager::new(seed, config.keys.clone());
    if let Some(store) = store {
        keys = keys.with_store(store);
    }
    if let Some(attestor) = attestor {
        keys = keys.with_attestor(attestor);
    }

    let active = keys
        .initialize(&shutdown)
        .await
        .unwrap_or_else(|e| fatal("Key manager failed to initialize (fail-closed)", e));

    let mut local_verifier = None;
    match &config.anchor {
        _ if !config.keys.require_anchor => {
            info!("REQUIRE_ANCHOR=false, rotations are not anchored on-chain");
        }
        AnchorConfig::Local => {
            let verifier = Arc::new(AnchorVerifier::new());
            let root = keys
                .public_key(None)
                .await
                .unwrap_or_else(|e| fatal("Failed to derive root public key", e));
            let caller = caller_address(&root.public_key)
                .unwrap_or_else(|e| fatal("Invalid root public key", e));
            verifier
                .register(caller, &root.public_key)
                .unwrap_or_else(|e| fatal("Failed to register anchor caller", e));
            info!(caller = %caller, key_version = %active, "Local anchor verifier registered");
            keys = keys.with_anchor(Arc::new(LocalAnchorSubmitter::new(
                Arc::clone(&verifier),
                caller,
            )));
            local_verifier = Some(verifier);
        }
        AnchorConfig::Evm {
            rpc_url,
            contract,
            tx_key_path,
        } => {
            let pem = std::fs::read(tx_key_path)
                .unwrap_or_else(|e| fatal("Failed to read ANCHOR_TX_KEY", e));
            let signer = signer_from_pem(&pem).unwrap_or_else(|e| fatal("Invalid ANCHOR_TX_KEY", e));
            let submitter = EvmAnchorSubmitter::new(rpc_url, *contract, signer, EVM_RECEIPT_TIMEOUT)
                .unwrap_or_else(|e| fatal("Failed to build anchor submitter", e));
            info!(contract = %contract, "EVM anchor submitter configured");
            keys = keys.with_anchor(Arc::new(submitter));
        }
    }
    let keys = Arc::new(keys);

    let limiter = Arc::new(ClientRateLimiter::new(config.rate_limit));

    let backend: Option<Arc<dyn AuditBackend>> = match &config.audit {
        AuditSinkConfig::None => None,
        AuditSinkConfig::File { dir } => Some(Arc::new(JsonlAuditBackend::new(dir.clone()))),
        AuditSinkConfig::Postgrest => {
            let pg = postgrest.as_ref().unwrap_or_else(|| fatal("Audit sink", "missing PostgREST settings"));
            let backend = PostgrestAuditBackend::new(pg)
                .unwrap_or_else(|e| fatal("Failed to build audit client", e));
            Some(Arc::new(backend))
        }
    };
    let (audit, audit_task) = match backend {
        Some(backend) => {
            let (sink, worker) =
                AuditSink::new(backend, config.audit_queue_capacity, config.audit_backoff);
            let task = tokio::spawn(worker.run(shutdown.clone(), AUDIT_DRAIN_DEADLINE));
            (sink, Some(task))
        }
        None => {
            warn!("Audit sink disabled");
            (AuditSink::disabled(), None)
        }
    };

    let maintenance = KeyMaintenance::new(Arc::clone(&keys))
        .with_limiter(Arc::clone(&limiter))
        .with_interval(config.refresh_interval);
    let maintenance_task = tokio::spawn(maintenance.run(shutdown.clone()));

    let endpoint = SigningEndpoint::new(Arc::clone(&keys), limiter, audit);
    let mut state = AppState::new(endpoint)
        .with_admin(config.admin.clone())
        .with_shutdown(shutdown.clone());
    if let Some(verifier) = local_verifier {
        state = state.with_anchor_verifier(verifier);
    }
    if config.admin.enabled {
        info!(operators = config.admin.identities.len(), "Admin interface enabled");
    }
    let app = router(state);

    // TLS is mandatory - no HTTP fallback
    let tls_paths = config
        .tls
        .as_ref()
        .unwrap_or_else(|| fatal("TLS configuration", "TLS_CERT_PATH and TLS_KEY_PATH are required"));
    if tls_paths.client_ca.is_none() {
        warn!("TLS_CLIENT_CA_PATH not set; every caller is served as `unknown`");
    }
    let tls = server_config(tls_paths).unwrap_or_else(|e| fatal("Failed to build TLS config", e));

    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!(error = %e, "Failed to listen for shutdown signal");
                    }
                    info!("Shutdown signal received");
                }
                _ = shutdown.cancelled() => {}
            }
            shutdown.cancel();
            handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN));
        });
    }

    info!(
        addr = %config.bind,
        key_version = %active,
        degraded = keys.is_degraded(),
        "Relational TEE signer listening on https (docs at /docs)"
    );

    let served = axum_server::bind(config.bind)
        .acceptor(PeerIdentityAcceptor::new(tls))
        .handle(handle)
        .serve(app.into_make_service())
        .await;
    if let Err(e) = served {
        error!(error = %e, "HTTPS server failed");
    }

    shutdown.cancel();
    if let Err(e) = maintenance_task.await {
        warn!(error = %e, "Key maintenance task ended abnormally");
    }
    if let Some(task) = audit_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Audit worker ended abnormally");
        }
    }
    info!("Shutdown complete");
}
