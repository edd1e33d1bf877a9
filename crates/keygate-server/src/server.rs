// crates/keygate-server/src/server.rs
// Orchestrator: constructs components, runs the loops, serves, shuts down

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use keygate_types::{CallerIdentity, MeterBucket};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::audit::AuditLog;
use crate::audit::export::AuditExporter;
use crate::config::GatewayConfig;
use crate::meter::batch::BatchIngester;
use crate::meter::sse::SseIngester;
use crate::meter::webhook::WebhookReceiver;
use crate::meter::{MeterSink, MeterStore};
use crate::objectstore::ObjectStoreClient;
use crate::proxy::McpProxy;
use crate::proxy::dispatch::LocalDispatcher;
use crate::proxy::registry::ToolRegistry;
use crate::secrets::resolver::ChildToolCaller;
use crate::secrets::{Resolver, SecretClient};
use crate::tools::{ApertureUsage, CampaignClient, GithubClient, TokenProvider};
use crate::web::state::AppState;

/// Secret-store key (under the configured prefix) receiving meter flushes.
const METER_SNAPSHOT_KEY: &str = "usage/meter-snapshot";

/// Flush sink that drains meter snapshots into the secret store.
struct SetecMeterSink {
    setec: Arc<SecretClient>,
}

#[async_trait]
impl MeterSink for SetecMeterSink {
    async fn flush(&self, buckets: &[MeterBucket]) -> std::result::Result<(), String> {
        let payload = serde_json::to_string(&json!({
            "flushed_at": Utc::now(),
            "buckets": buckets,
        }))
        .map_err(|e| e.to_string())?;
        self.setec
            .put(METER_SNAPSHOT_KEY, &payload)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// GitHub token provider backed by the composite resolver. Token accesses
/// are audited under the gateway's own identity, since they happen on
/// behalf of whichever caller invoked a GitHub tool.
struct ResolverTokens {
    resolver: Arc<Resolver>,
}

#[async_trait]
impl TokenProvider for ResolverTokens {
    async fn token(&self) -> std::result::Result<String, String> {
        let gateway = CallerIdentity {
            node: "gateway".to_string(),
            login: "keygate".to_string(),
            ..Default::default()
        };
        let result = self.resolver.resolve(&gateway, "GITHUB_TOKEN", &[]).await;
        if let Some(error) = result.error {
            return Err(error);
        }
        Ok(result.value)
    }
}

/// Build everything, run until interrupted, then shut down cleanly.
pub async fn run(config: GatewayConfig) -> Result<()> {
    let http = crate::http::create_shared_client();
    let audit = Arc::new(AuditLog::default());
    let meter = Arc::new(MeterStore::new());
    let registry = Arc::new(ToolRegistry::new());

    let setec = if config.setec_url.is_empty() {
        None
    } else {
        Some(Arc::new(SecretClient::new(
            http.clone(),
            config.setec_url.clone(),
            config.setec_prefix.clone(),
            Duration::from_secs(config.setec_poll_interval),
            config.setec_secrets.clone(),
        )))
    };

    // Subprocess spawn failure is fatal; the operational layer restarts us.
    let proxy = if config.chapel_binary.is_empty() {
        info!("No helper binary configured, serving gateway tools only");
        None
    } else {
        let proxy = Arc::new(McpProxy::new(registry.clone()));
        proxy
            .start(&config.chapel_binary)
            .await
            .context("failed to start MCP helper subprocess")?;
        Some(proxy)
    };

    let child_caller: Option<Arc<dyn ChildToolCaller>> = proxy
        .clone()
        .map(|p| p as Arc<dyn ChildToolCaller>);
    let resolver = Arc::new(Resolver::new(
        config.precedence.clone(),
        child_caller,
        setec.clone(),
        audit.clone(),
    ));

    let github = Arc::new(GithubClient::new(
        http.clone(),
        Arc::new(ResolverTokens {
            resolver: resolver.clone(),
        }),
    ));
    let campaigns = if config.campaign_runner_url.is_empty() {
        None
    } else {
        Some(Arc::new(CampaignClient::new(
            http.clone(),
            config.campaign_runner_url.clone(),
        )))
    };
    let usage = Arc::new(ApertureUsage::new(
        http.clone(),
        Some(config.aperture_url.clone()),
        Some(meter.clone()),
    ));
    let dispatcher = Arc::new(LocalDispatcher::new(
        registry.clone(),
        resolver.clone(),
        setec.clone(),
        audit.clone(),
        campaigns,
        Some(github),
        usage.clone(),
    ));
    let webhook = Arc::new(WebhookReceiver::new(
        config.webhook_secret.clone(),
        meter.clone(),
    ));

    if let Some(setec) = &setec {
        meter.set_sink(Arc::new(SetecMeterSink {
            setec: setec.clone(),
        }));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                let _ = tx.send(true);
            }
        });
    }

    let mut loops: Vec<JoinHandle<()>> = Vec::new();
    loops.push(tokio::spawn(meter.clone().flush_loop(
        Duration::from_secs(config.meter_flush_interval),
        shutdown_rx.clone(),
    )));
    if let Some(setec) = &setec {
        loops.push(tokio::spawn(setec.clone().poll_loop(shutdown_rx.clone())));
    }
    if !config.aperture_url.is_empty() {
        let ingester = SseIngester::new(
            crate::http::create_sse_client(),
            &config.aperture_url,
            Duration::from_secs(config.aperture_sse_reconnect),
            meter.clone(),
        );
        loops.push(tokio::spawn(ingester.run(shutdown_rx.clone())));
    }
    if config.aperture_s3.is_configured() {
        let objects = Arc::new(ObjectStoreClient::new(http.clone(), &config.aperture_s3));
        let batch = BatchIngester::new(
            meter.clone(),
            objects.clone(),
            config.aperture_s3.prefix.clone(),
            Duration::from_secs(config.aperture_batch_interval),
        );
        loops.push(tokio::spawn(batch.run(shutdown_rx.clone())));

        let exporter = AuditExporter::new(
            audit.clone(),
            objects,
            config.audit_s3_prefix.clone(),
            Duration::from_secs(config.audit_s3_interval),
        );
        loops.push(tokio::spawn(exporter.run(shutdown_rx.clone())));
    }

    let state = AppState {
        proxy: proxy.clone(),
        registry,
        dispatcher,
        resolver,
        audit,
        meter,
        setec,
        webhook,
        usage,
    };
    let app = crate::web::create_router(state);
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    // Listener bind failure is fatal with a clear message.
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!(addr = %config.listen, "Gateway listening");

    let mut main_shutdown = shutdown_rx.clone();
    let main_serve = axum::serve(listener, make_service.clone())
        .with_graceful_shutdown(async move {
            let _ = main_shutdown.changed().await;
        });

    if config.in_cluster_listen.is_empty() {
        main_serve.await.context("server error")?;
    } else {
        let cluster_listener = TcpListener::bind(&config.in_cluster_listen)
            .await
            .with_context(|| format!("failed to bind {}", config.in_cluster_listen))?;
        info!(addr = %config.in_cluster_listen, "In-cluster listener up");

        let mut cluster_shutdown = shutdown_rx.clone();
        let cluster_serve = axum::serve(cluster_listener, make_service)
            .with_graceful_shutdown(async move {
                let _ = cluster_shutdown.changed().await;
            });
        tokio::try_join!(
            async move { main_serve.await },
            async move { cluster_serve.await },
        )
        .context("server error")?;
    }

    // Serve returned: make sure every loop sees the signal, then let each
    // finish its terminal flush/export.
    let _ = shutdown_tx.send(true);
    for handle in loops {
        let _ = tokio::time::timeout(Duration::from_secs(15), handle).await;
    }
    if let Some(proxy) = proxy {
        proxy.stop().await;
    }
    info!("Gateway stopped");
    Ok(())
}
