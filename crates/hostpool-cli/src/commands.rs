use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hostpool_api::{build_app, AppState, SessionLayer};
use hostpool_broker::Broker;
use hostpool_config::{Settings, SshCredentials};
use hostpool_inspect::{default_inspectors, SshExec};
use hostpool_provision::{LabConfig, LabProvisioner, LocalProvisioner, ProvisionerRegistry};
use hostpool_store::{MachineStore, MemoryStore, RedbStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use trust_dns_resolver::TokioAsyncResolver;

use crate::output;

pub async fn serve(
    port: Option<u16>,
    bind: Option<String>,
    store_path: Option<PathBuf>,
) -> Result<()> {
    let mut settings = Settings::from_env()?;
    if let Some(port) = port {
        settings.port = port;
    }
    if let Some(bind) = bind {
        settings.bind = bind;
    }
    if let Some(store_path) = store_path {
        settings.store_path = Some(store_path);
    }

    let store: Arc<dyn MachineStore> = match &settings.store_path {
        Some(path) => {
            info!(path = %path.display(), "opening machine store");
            Arc::new(RedbStore::open(path)?)
        }
        None => {
            warn!("APP_STORE_PATH not set; machine records will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let credentials = match &settings.ssh_credentials {
        Some(path) => SshCredentials::load(path)?,
        None => SshCredentials::default(),
    };
    let exec = Arc::new(SshExec::new(credentials));

    let mut provisioners = ProvisionerRegistry::new();
    provisioners.register(Arc::new(LocalProvisioner::new()));
    if let Some(url) = &settings.lab_url {
        provisioners.register(Arc::new(LabProvisioner::new(LabConfig {
            url: url.clone(),
            command: settings.lab_command.clone(),
            group: "hostpool".to_string(),
        })));
    } else {
        info!("APP_LAB_URL not set; lab provisioner disabled");
    }

    let broker = Arc::new(
        Broker::new(store, default_inspectors(), provisioners, exec)
            .context("parameter registry is inconsistent")?,
    );

    let resumed = broker.resume_tasks().await?;
    info!(resumed, "restart recovery complete");

    let cancel = CancellationToken::new();
    broker.spawn_housekeeper(Duration::from_secs(settings.sweep_interval), &cancel);

    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => Some(Arc::new(resolver)),
        Err(e) => {
            warn!(error = %e, "no system resolver; peer callbacks match raw IPs only");
            None
        }
    };

    let state = AppState {
        broker,
        sessions: Arc::new(SessionLayer::new(&settings.session_secret)),
        resolver,
    };
    let app = build_app(state);

    let addr: SocketAddr = format!("{}:{}", settings.bind, settings.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", settings.bind, settings.port))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "hostpool listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
        cancel.cancel();
    })
    .await?;
    Ok(())
}

pub async fn status(remote: String) -> Result<()> {
    let client = reqwest::Client::new();
    let info: serde_json::Value = client
        .get(format!("{}/", remote.trim_end_matches('/')))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let machines: serde_json::Value = client
        .get(format!("{}/machines", remote.trim_end_matches('/')))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    output::print_status(&info, machines.as_array().map(Vec::as_slice).unwrap_or(&[]));
    Ok(())
}

pub async fn parameters(remote: String) -> Result<()> {
    let schema: serde_json::Value = reqwest::Client::new()
        .get(format!("{}/parameters", remote.trim_end_matches('/')))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    output::print_json(&schema);
    Ok(())
}

pub async fn machines(remote: String, args: Vec<String>) -> Result<()> {
    let pairs: Vec<(String, String)> = args
        .iter()
        .map(|arg| match arg.split_once('=') {
            Some((k, v)) => Ok((k.to_string(), v.to_string())),
            None => anyhow::bail!("argument '{}' is not key=value", arg),
        })
        .collect::<Result<_>>()?;
    let machines: serde_json::Value = reqwest::Client::new()
        .get(format!("{}/machines", remote.trim_end_matches('/')))
        .query(&pairs)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    output::print_machines(machines.as_array().map(Vec::as_slice).unwrap_or(&[]));
    Ok(())
}
