use std::process::ExitCode;
use std::sync::Arc;

use log::{LevelFilter, error, info, warn};

use acme_cert_renewer::core::config::Configuration;
use acme_cert_renewer::core::shutdown::ShutdownSignal;
use acme_cert_renewer::distribution::export::BundleExporter;
use acme_cert_renewer::distribution::rancher::RancherStore;
use acme_cert_renewer::domain::normalize_domain_for_display;
use acme_cert_renewer::issuance::acme::AccountKeyStore;
use acme_cert_renewer::issuance::acme_workflow::AcmeLibIssuer;
use acme_cert_renewer::issuance::dns::DohPropagationChecker;
use acme_cert_renewer::issuance::dns_providers::adapter_for_provider;
use acme_cert_renewer::issuance::flow::AcmeIssuanceClient;
use acme_cert_renewer::renewal::{RenewalOrchestrator, RenewalScheduler};

fn init_logging(debug: bool) {
    let default_level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    // RUST_LOG, when set, takes precedence over the DEBUG switch.
    env_logger::Builder::new()
        .filter_level(default_level)
        .filter_module("reqwest", LevelFilter::Warn)
        .filter_module("hyper", LevelFilter::Warn)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Configuration::from_env() {
        Ok(config) => config,
        Err(err) => {
            init_logging(false);
            for problem in &err.problems {
                error!("[config] {problem}");
            }
            error!("[config] refusing to start with {} configuration problem(s)", err.problems.len());
            return ExitCode::from(1);
        }
    };
    init_logging(config.debug);
    let config = Arc::new(config);

    info!(
        "[renewal] managing '{}' for {} via {} ({} directory, {} key)",
        config.cert_display_name,
        config
            .domains
            .iter()
            .map(|d| normalize_domain_for_display(d))
            .collect::<Vec<_>>()
            .join(", "),
        config.dns_provider.name(),
        config.api_environment.as_str(),
        config.key_type
    );

    let shutdown = ShutdownSignal::new();
    let account_keys = AccountKeyStore::new(&config.state_dir, config.api_environment);
    let backend = AcmeLibIssuer::new(
        config.api_environment.directory_url(),
        &config.account_email,
        account_keys,
    );
    let issuer = AcmeIssuanceClient::new(
        Box::new(backend),
        adapter_for_provider(&config.dns_provider),
        Box::new(DohPropagationChecker::new(config.propagation_timeout)),
        shutdown.clone(),
    );
    let store = RancherStore::new(&config.store);

    let mut orchestrator = RenewalOrchestrator::new(
        Arc::clone(&config),
        Box::new(issuer),
        Box::new(store),
        shutdown.clone(),
    );
    if let Some(dir) = &config.export_dir {
        info!("[renewal] exporting certificate files to {}", dir.display());
        orchestrator = orchestrator.with_exporter(BundleExporter::new(dir));
    }
    let orchestrator = Arc::new(orchestrator);

    let lookup = Arc::clone(&orchestrator);
    match tokio::task::spawn_blocking(move || lookup.refresh_current()).await {
        Ok(Ok(Some(current))) => match current.current_expiry {
            Some(expiry) => info!(
                "[renewal] found '{}' (id {}), expires {}",
                current.name, current.id, expiry
            ),
            None => info!(
                "[renewal] found '{}' (id {}) with unknown expiry",
                current.name, current.id
            ),
        },
        Ok(Ok(None)) => info!(
            "[renewal] no certificate named '{}' in the store yet",
            config.cert_display_name
        ),
        Ok(Err(err)) => warn!("[renewal] startup lookup failed: {err}"),
        Err(err) => warn!("[renewal] startup lookup join error: {err}"),
    }

    let signals = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("[renewal] shutdown requested");
        signals.trigger();
    });

    RenewalScheduler::new(orchestrator, shutdown).run().await;
    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(err) => {
            warn!("[renewal] cannot listen for SIGTERM: {err}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
