//! flotta Device Agent
//!
//! The device agent runs on each edge device. It enrols with the control
//! plane, obtains a client certificate, and then keeps the device's workloads
//! converged on the desired set it fetches every heartbeat.
//!
//! ## Tasks
//!
//! - **Controller**: enrol, register, then heartbeat + configuration fetch
//! - **Scheduler**: owns the job store and reconciles every job each tick
//! - **Profile loop**: samples host metrics and evaluates device profiles

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flotta_device_agent::certificate::CertificateManager;
use flotta_device_agent::client::HttpControlPlaneClient;
use flotta_device_agent::config::{Cli, Config};
use flotta_device_agent::controller::{Controller, ControllerChannels, ControllerConfig};
use flotta_device_agent::metrics::{HostSampler, ProfileConfig, ProfileLoop};
use flotta_device_agent::scheduler::SchedulerConfig;
use flotta_device_agent::{
    CgroupFsManager, MockExecutor, Scheduler, SystemClock, TimedExecutor,
};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Device agent failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    // RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        device_id = %config.device_id,
        server = %config.server,
        namespace = %config.namespace,
        "Starting flotta device agent"
    );

    let certificates = Arc::new(
        CertificateManager::load(
            &config.ca_root,
            config.cert_file.as_deref(),
            config.key_file.as_deref(),
        )
        .context("failed to load certificates")?,
    );

    let control_plane = Arc::new(
        HttpControlPlaneClient::new(
            config.server.clone(),
            Arc::clone(&certificates),
            config.request_timeout,
        )
        .context("failed to build control plane client")?,
    );

    // The in-memory executor stands in for a container runtime
    let executor = Arc::new(TimedExecutor::new(
        Arc::new(MockExecutor::new()),
        config.request_timeout,
        config.stop_timeout,
    ));
    let resource_manager = Arc::new(CgroupFsManager::new(config.cgroup_root.clone()));
    let clock = Arc::new(SystemClock);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (desired_tx, desired_rx) = mpsc::channel(16);
    let (profile_event_tx, profile_event_rx) = mpsc::channel(64);
    let (profiles_tx, profiles_rx) = watch::channel(ProfileConfig::default());

    let scheduler = Scheduler::new(
        executor,
        resource_manager,
        clock.clone(),
        SchedulerConfig {
            heartbeat_period: config.heartbeat_period,
            root_slice: config.root_slice.clone(),
            ..Default::default()
        },
    );
    let status_rx = scheduler.subscribe();

    let scheduler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            scheduler
                .run(desired_rx, profile_event_rx, shutdown_rx)
                .await;
        }
    });

    let profile_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        let profile_loop = ProfileLoop::new(Arc::new(HostSampler), profile_event_tx);
        async move {
            profile_loop.run(profiles_rx, shutdown_rx).await;
        }
    });

    let controller = Controller::new(
        config.device_id.clone(),
        control_plane,
        certificates,
        ControllerChannels {
            desired_tx,
            profiles_tx,
            status_rx,
        },
        clock,
        ControllerConfig {
            namespace: config.namespace.clone(),
            heartbeat_period: config.heartbeat_period,
            ..Default::default()
        },
    );
    let controller_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            controller.run(shutdown_rx).await;
        }
    });

    let mut handles: Vec<(&'static str, JoinHandle<()>)> = vec![
        ("controller", controller_handle),
        ("scheduler", scheduler_handle),
        ("profile loop", profile_handle),
    ];

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    info!(
        timeout_secs = config.graceful_shutdown.as_secs(),
        "Waiting for tasks to shut down"
    );
    let deadline = tokio::time::Instant::now() + config.graceful_shutdown;
    for (name, handle) in handles.iter_mut() {
        match tokio::time::timeout_at(deadline, &mut *handle).await {
            Ok(Ok(())) => info!(task = *name, "Task stopped"),
            Ok(Err(e)) => error!(task = *name, error = %e, "Task panicked"),
            Err(_) => {
                warn!(task = *name, "Task did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    info!("Device agent shutdown complete");
    Ok(())
}
