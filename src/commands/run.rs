use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use futures::StreamExt;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use k8s_openapi::chrono::{self, Utc};
use kube::Client;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::Controller;
use kube::runtime::events::Reporter;
use kube_runtime::watcher;
use tokio::signal;
use tokio::sync::{Mutex, broadcast};
use tokio::time::sleep;
use tracing::{info, warn};

use signal_processor::audit::{AuditConfig, AuditEmitter};
use signal_processor::cache::TtlCache;
use signal_processor::config::OperatorConfig;
use signal_processor::crd::SignalProcessing;
use signal_processor::enrich::EnrichConfig;
use signal_processor::metrics;
use signal_processor::policy::{self, PolicyBundle};
use signal_processor::reconciler::{self, Context};
use signal_processor::reload;

/* ============================= CONFIG ============================= */

const LEASE_NAME: &str = "signal-processor-leader";
const LEASE_NAMESPACE: &str = "kubernaut-system";
const LEASE_DURATION_SECONDS: i32 = 15;
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);
const LEASE_HOLDER: &str = "signal-processor-instance";
const STANDBY_RETRY: Duration = Duration::from_secs(10);

pub struct RunArgs {
    pub policy_dir: PathBuf,
    pub audit_url: Option<String>,
    pub phase_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub owner_chain_depth: usize,
    pub metrics_addr: SocketAddr,
    pub probe_addr: SocketAddr,
}

impl RunArgs {
    fn into_config(self) -> OperatorConfig {
        OperatorConfig {
            policy_dir: self.policy_dir,
            audit_endpoint: self.audit_url.clone(),
            phase_timeout: Duration::from_secs(self.phase_timeout_secs),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            enrich: EnrichConfig {
                owner_chain_depth: self.owner_chain_depth,
                ..Default::default()
            },
            audit: AuditConfig {
                endpoint: self.audit_url,
                ..Default::default()
            },
            metrics_addr: self.metrics_addr,
            probe_addr: self.probe_addr,
            ..Default::default()
        }
    }
}

/* ============================= STATE ============================= */

pub(crate) struct OperatorState {
    pub(crate) ready: bool,
}

/* ============================= ENTRY ============================= */

pub async fn run(args: RunArgs) -> Result<()> {
    println!("Starting SignalProcessing operator...\n");

    let config = args.into_config();

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    // Verify actual cluster connectivity before starting the controller
    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    // Initial policy bundle; an unreadable or broken bundle starts the
    // operator in fallback-only mode rather than refusing to run.
    print!("  Policy bundle ............... ");
    let bundle = match reload::load_bundle(&config.policy_dir).await {
        Ok(bundle) => {
            println!("OK (digest {})", &bundle.digest[..12.min(bundle.digest.len())]);
            bundle
        }
        Err(e) => {
            println!("INVALID ({e}), starting fallback-only");
            warn!(error = %e, "initial_policy_bundle_invalid");
            PolicyBundle::empty()
        }
    };
    let shared_bundle = policy::shared(bundle);

    metrics::force_init();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Leader election: a single active instance writes status; extra
    // replicas stand by until the lease lapses.
    print!("  Leader election ............. ");
    if matches!(claim_lease(&client).await?, LeaseClaim::OtherHolder) {
        println!("standby (lease held by another instance)");
        info!("leader_standby");
        loop {
            sleep(STANDBY_RETRY).await;
            if matches!(claim_lease(&client).await?, LeaseClaim::Held) {
                break;
            }
        }
        print!("  Leader election ............. ");
    }
    println!("acquired");
    info!("leader_lease_claimed");

    let renewal_client = client.clone();
    let renewal_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move { renew_lease_until_shutdown(renewal_client, renewal_shutdown).await });

    // Audit emitter and its drain handle.
    let (audit, audit_handle) = AuditEmitter::spawn(config.audit.clone());

    // Enrichment cache with periodic sweeping.
    let cache = Arc::new(TtlCache::new(config.cache_ttl));
    let sweep_cache = cache.clone();
    let mut sweep_shutdown = shutdown_tx.subscribe();
    let sweep_interval = config.cache_ttl;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(sweep_interval) => sweep_cache.sweep(),
                _ = sweep_shutdown.recv() => return,
            }
        }
    });

    // Policy hot-reloader.
    let watcher_handle = reload::spawn_watcher(
        config.policy_dir.clone(),
        shared_bundle.clone(),
        shutdown_tx.subscribe(),
    );

    let state = Arc::new(Mutex::new(OperatorState { ready: false }));

    // Metrics and probe endpoints live on separate listeners.
    let metrics_handle = {
        let shutdown = shutdown_tx.subscribe();
        let addr = config.metrics_addr;
        tokio::spawn(async move { serve(build_metrics_router(), addr, shutdown).await })
    };
    let probe_handle = {
        let shutdown = shutdown_tx.subscribe();
        let addr = config.probe_addr;
        let state = state.clone();
        tokio::spawn(async move { serve(build_probe_router(state), addr, shutdown).await })
    };

    println!("  CRD watch ................... SignalProcessing.signalprocessing.kubernaut.io/v1");
    println!("  Policy directory ............ {}", config.policy_dir.display());
    println!(
        "  Phase timeout ............... {}s",
        config.phase_timeout.as_secs()
    );
    println!("  Metrics server .............. http://{}", config.metrics_addr);
    println!("  Probe server ................ http://{}", config.probe_addr);
    println!();
    println!("  Available endpoints:");
    println!("    GET /metrics .............. Prometheus metrics scrape endpoint");
    println!("    GET /healthz .............. Liveness probe (always 200 OK)");
    println!(
        "    GET /readyz ............... Readiness probe (503 until first reconcile, then 200)"
    );
    println!();
    println!("Operator running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("operator_controller_started");

    let ctx = Arc::new(Context {
        client: client.clone(),
        bundle: shared_bundle,
        audit: audit.clone(),
        cache,
        config,
        reporter: Reporter {
            controller: "signal-processor".into(),
            instance: std::env::var("HOSTNAME").ok(),
        },
    });

    let signals: Api<SignalProcessing> = Api::all(client.clone());

    let controller_state = state.clone();
    let controller = Controller::new(signals, watcher::Config::default())
        .run(reconciler::reconcile, reconciler::error_policy, ctx.clone())
        .for_each(move |result| {
            let state = controller_state.clone();
            async move {
                // Mark ready after first reconcile dispatch
                {
                    let mut s = state.lock().await;
                    if !s.ready {
                        s.ready = true;
                    }
                }
                match result {
                    Ok((obj, _action)) => {
                        tracing::debug!(resource = %obj.name, "reconcile_dispatch_ok");
                    }
                    Err(e) => {
                        warn!(error = %e, "reconcile_dispatch_error");
                    }
                }
            }
        });

    // select! so Ctrl+C drops (cancels) the controller stream; in-flight
    // reconciles observe the canceled context and requeue onto the next
    // leader.
    tokio::select! {
        _ = controller => {
            info!("operator_controller_stream_ended");
            println!("\nController stream ended unexpectedly.");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping operator...");
            println!("{}", "=".repeat(70));
        }
    }

    let _ = shutdown_tx.send(());

    // Drop our emitter handle so the audit worker drains and exits; the
    // context's clone goes away with the controller stream above.
    let drain_deadline = ctx.config.drain_deadline;
    drop(ctx);
    drop(audit);
    if tokio::time::timeout(drain_deadline, audit_handle).await.is_err() {
        warn!("audit_drain_deadline_exceeded");
    }

    let _ = watcher_handle.await;
    let _ = metrics_handle.await;
    let _ = probe_handle.await;

    info!("operator_stopped");
    println!("Operator stopped.");
    Ok(())
}

/* ============================= LEADER ELECTION ============================= */

/// Outcome of one attempt to claim the leader lease.
enum LeaseClaim {
    Held,
    OtherHolder,
}

/// True when the lease is up for grabs at `now`: never written, held by this
/// identity already, or not renewed within its lease duration.
fn lease_claimable(spec: Option<&LeaseSpec>, now: chrono::DateTime<Utc>) -> bool {
    let Some(spec) = spec else {
        return true;
    };
    if spec.holder_identity.as_deref() == Some(LEASE_HOLDER) {
        return true;
    }
    let Some(renewed) = &spec.renew_time else {
        return true;
    };
    let ttl = i64::from(spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECONDS));
    now.signed_duration_since(renewed.0) > chrono::Duration::seconds(ttl)
}

/// Try once to become the leader. Losing a create or patch race simply
/// reports the lease as held elsewhere; only unexpected API errors surface.
async fn claim_lease(client: &Client) -> Result<LeaseClaim> {
    let leases: Api<Lease> = Api::namespaced(client.clone(), LEASE_NAMESPACE);
    let stamp = MicroTime(Utc::now());

    let Some(current) = leases.get_opt(LEASE_NAME).await? else {
        let fresh = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(LEASE_HOLDER.to_string()),
                lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
                acquire_time: Some(stamp.clone()),
                renew_time: Some(stamp),
                ..Default::default()
            }),
        };
        return match leases.create(&Default::default(), &fresh).await {
            Ok(_) => Ok(LeaseClaim::Held),
            Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(LeaseClaim::OtherHolder),
            Err(e) => Err(e.into()),
        };
    };

    if !lease_claimable(current.spec.as_ref(), stamp.0) {
        return Ok(LeaseClaim::OtherHolder);
    }

    let claim = serde_json::json!({
        "spec": {
            "holderIdentity": LEASE_HOLDER,
            "leaseDurationSeconds": LEASE_DURATION_SECONDS,
            "acquireTime": stamp,
            "renewTime": stamp,
        }
    });
    match leases
        .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&claim))
        .await
    {
        Ok(_) => Ok(LeaseClaim::Held),
        Err(e) => {
            info!(error = %e, "leader_lease_claim_lost");
            Ok(LeaseClaim::OtherHolder)
        }
    }
}

/// Keep the claimed lease fresh until shutdown. A failed renewal is logged
/// and retried on the next tick; a lapsed lease lets a standby take over.
async fn renew_lease_until_shutdown(client: Client, mut shutdown: broadcast::Receiver<()>) {
    let leases: Api<Lease> = Api::namespaced(client, LEASE_NAMESPACE);
    let mut tick = tokio::time::interval(LEASE_RENEW_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("leader_lease_released");
                return;
            }
            _ = tick.tick() => {
                let renewal = serde_json::json!({
                    "spec": {"renewTime": MicroTime(Utc::now())}
                });
                if let Err(e) = leases
                    .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(&renewal))
                    .await
                {
                    warn!(error = %e, "leader_lease_renew_failed");
                }
            }
        }
    }
}

/* ============================= HTTP SERVERS ============================= */

pub(crate) fn build_metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

pub(crate) fn build_probe_router(state: Arc<Mutex<OperatorState>>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
}

async fn serve(app: Router, addr: SocketAddr, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind server on {addr}"))?;

    info!(addr = %addr, "http_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(state: Arc<Mutex<OperatorState>>) -> impl IntoResponse {
    let ready = state.lock().await.ready;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, if ready { "READY" } else { "NOT READY" })
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::render() {
        Ok(body) => (StatusCode::OK, body),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= TESTS ============================= */
