use clap::Parser;
use log::{error, info, warn};
use ndsi_depth_bridge::config::{Cli, Config, load_dotenv};
use ndsi_depth_bridge::coordinator::{Coordinator, LoggingAnnouncer};
use ndsi_depth_bridge::error::BridgeError;
use ndsi_depth_bridge::input::simulation::SimulatedCameraProvider;
use ndsi_depth_bridge::instance_lock::{InstanceLock, InstanceLockError};
use ndsi_depth_bridge::ndsi::ZmqTransport;
use ndsi_depth_bridge::netif::{AddressSource, spawn_address_watcher};
use ndsi_depth_bridge::sensors::TokioScheduler;
use ndsi_depth_bridge::service::BridgeService;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    // Environment writes must happen before the runtime starts its threads.
    load_dotenv();
    init_logger();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    runtime.block_on(run());
}

async fn run() {
    info!("Starting NDSI depth bridge");

    let mut config = Config::from_env();
    Cli::parse().apply(&mut config);

    let _lock = match InstanceLock::acquire() {
        Ok(lock) => lock,
        Err(InstanceLockError::AlreadyRunning) => {
            error!("Another ndsi-depth-bridge is already running");
            std::process::exit(1);
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let address_source = config.address_source();
    info!("Configuration loaded:");
    info!("  Host name: {}", config.network.host_name);
    info!("  Bind host: {}", config.network.bind_host);
    info!("  Listen address: {:?}", address_source);
    info!("  Simulated cameras: {}", config.simulation.cameras);

    let (coordinator, coordinator_task) = Coordinator::start(
        Arc::new(ZmqTransport::new(config.network.bind_host.clone())),
        Arc::new(LoggingAnnouncer::new(config.network.host_name.clone())),
        address_source.clone(),
        config.coordinator_config(),
    );

    let service = Arc::new(BridgeService::new(
        coordinator.clone(),
        Arc::new(SimulatedCameraProvider::new(config.simulation.cameras)),
        Arc::new(TokioScheduler::current()),
        config.pipeline_config(),
    ));

    for _ in 0..config.simulation.cameras {
        match service.attach().await {
            Ok(descriptor) => info!("Attached {} ({})", descriptor.name, descriptor.uuid),
            Err(BridgeError::NoCamera) => break,
            Err(e) => warn!("Failed to attach camera: {}", e),
        }
    }

    let watcher = match address_source {
        AddressSource::Interface(_) => Some(spawn_address_watcher(
            address_source,
            config.address_poll_interval(),
            coordinator.clone(),
        )),
        AddressSource::Fixed(_) => None,
    };

    let status_task = tokio::spawn({
        let service = service.clone();
        let period = config.status_interval();
        async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                service.log_status();
            }
        }
    });

    info!("NDSI depth bridge is running");
    info!("  - SIGHUP: soft network reset");
    info!("  - SIGUSR2: hard network reset");
    info!("  - SIGUSR1: check sensors");
    info!("  - Press Ctrl+C to exit");

    if let Err(e) = handle_signals(&service).await {
        error!("Failed to listen for signals: {}", e);
    }

    status_task.abort();
    if let Some(watcher) = watcher {
        watcher.abort();
    }
    match service.detach_all().await {
        Ok(count) => info!("Detached {} sensor(s)", count),
        Err(e) => warn!("Failed to detach sensors: {}", e),
    }
    if let Err(e) = coordinator.shutdown().await {
        warn!("Failed to stop coordinator: {}", e);
    }
    let _ = coordinator_task.await;

    info!("NDSI depth bridge stopped");
}

/// Dispatch host signals until Ctrl+C or SIGTERM.
async fn handle_signals(service: &BridgeService) -> std::io::Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut user1 = signal(SignalKind::user_defined1())?;
    let mut user2 = signal(SignalKind::user_defined2())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("Received SIGHUP, rebinding sensors");
                if let Err(e) = service.restart_manager(true).await {
                    warn!("Soft reset failed: {}", e);
                }
            }
            _ = user2.recv() => {
                info!("Received SIGUSR2, recreating sensors");
                if let Err(e) = service.restart_manager(false).await {
                    warn!("Hard reset failed: {}", e);
                }
            }
            _ = user1.recv() => {
                match service.check_all_sensors().await {
                    Ok(health) => {
                        for sensor in health {
                            info!("[Health] {} {}", sensor.name, if sensor.healthy { "ok" } else { "failed" });
                        }
                    }
                    Err(e) => warn!("Sensor check failed: {}", e),
                }
                service.log_status();
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received shutdown signal");
                return Ok(());
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM");
                return Ok(());
            }
        }
    }
}
