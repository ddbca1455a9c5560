//! Sensor coordinator.
//!
//! One task owns every [`SensorLink`] and drives the service loop: for each
//! sensor it polls commands, publishes a pending frame and flushes control
//! changes. Everything else talks to it through a [`Coordinator`] handle, so
//! socket access per sensor is never concurrent and no lock is held across a
//! network send.

pub mod announce;

pub use announce::{Announcer, LoggingAnnouncer};

use crate::error::{BridgeError, Result};
use crate::ndsi::{SensorAttach, Transport};
use crate::netif::AddressSource;
use crate::sensors::link::spawn_release;
use crate::sensors::{ReadyNotifier, Sensor, SensorLink};
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Attached sensors by UUID, readable outside the service loop.
pub type SensorRegistry = Arc<RwLock<HashMap<Uuid, Arc<dyn Sensor>>>>;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Bound on binding one sensor's sockets.
    pub bind_timeout: Duration,
    /// Longest the loop sleeps when no sensor signalled data.
    pub idle_poll: Duration,
    /// Bounded wait for a frame once a sensor reports one pending.
    pub frame_wait: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_timeout: Duration::from_secs(5),
            idle_poll: Duration::from_millis(10),
            frame_wait: Duration::from_millis(200),
        }
    }
}

/// Outcome of pinging one sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorHealth {
    pub uuid: String,
    pub name: String,
    pub healthy: bool,
}

enum Request {
    AddSensor {
        sensor: Arc<dyn Sensor>,
        reply: oneshot::Sender<Result<SensorAttach>>,
    },
    RemoveAll {
        reply: oneshot::Sender<usize>,
    },
    ResetNetwork {
        soft: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    AddressChanged {
        reply: oneshot::Sender<Result<bool>>,
    },
    DetachSensors {
        sensors: Vec<Arc<dyn Sensor>>,
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the running coordinator.
#[derive(Clone)]
pub struct Coordinator {
    requests: mpsc::Sender<Request>,
    registry: SensorRegistry,
    listen_address: Arc<RwLock<Option<String>>>,
    notifier: ReadyNotifier,
}

impl Coordinator {
    /// Spawn the service loop. The returned task ends after `shutdown`.
    pub fn start(
        transport: Arc<dyn Transport>,
        announcer: Arc<dyn Announcer>,
        addresses: AddressSource,
        config: CoordinatorConfig,
    ) -> (Self, JoinHandle<()>) {
        let (requests, rx) = mpsc::channel(32);
        let registry = SensorRegistry::default();
        let listen_address = Arc::new(RwLock::new(None));
        let notifier = ReadyNotifier::new();

        let service = ServiceLoop {
            requests: rx,
            links: Vec::new(),
            registry: registry.clone(),
            listen_address: listen_address.clone(),
            transport,
            announcer,
            addresses,
            notifier: notifier.clone(),
            config,
        };
        let task = tokio::spawn(service.run());

        let coordinator = Self {
            requests,
            registry,
            listen_address,
            notifier,
        };
        (coordinator, task)
    }

    /// Signal handed to sensors so the loop wakes when data is queued.
    pub fn ready_notifier(&self) -> ReadyNotifier {
        self.notifier.clone()
    }

    /// Wake the service loop; never blocks.
    pub fn notify_sensor_ready(&self) {
        self.notifier.notify();
    }

    pub fn sensors(&self) -> Vec<Arc<dyn Sensor>> {
        self.registry.read().values().cloned().collect()
    }

    pub fn sensor_count(&self) -> usize {
        self.registry.read().len()
    }

    pub fn listen_address(&self) -> Option<String> {
        self.listen_address.read().clone()
    }

    /// Bind the sensor's sockets, announce it and start servicing it.
    pub async fn add_sensor(&self, sensor: Arc<dyn Sensor>) -> Result<SensorAttach> {
        self.request(|reply| Request::AddSensor { sensor, reply })
            .await?
    }

    /// Announce the detach of every sensor, close its sockets and release
    /// its hardware. Returns how many sensors were removed.
    pub async fn remove_all_sensors(&self) -> Result<usize> {
        self.request(|reply| Request::RemoveAll { reply }).await
    }

    /// Re-derive the listen address and rebind every sensor. A soft reset
    /// keeps each sensor's sequence counters; a hard reset recreates the
    /// links so they restart from zero.
    pub async fn reset_network(&self, soft: bool) -> Result<()> {
        self.request(|reply| Request::ResetNetwork { soft, reply })
            .await?
    }

    /// Rebind and re-announce if the externally reachable address moved.
    /// Returns whether anything was rebound.
    pub async fn address_changed(&self) -> Result<bool> {
        self.request(|reply| Request::AddressChanged { reply })
            .await?
    }

    /// Ping every sensor and detach the unhealthy ones. Pings run on the
    /// blocking pool outside the service loop, so a slow sensor does not
    /// hold up the others.
    pub async fn check_all_sensors(&self) -> Result<Vec<SensorHealth>> {
        let sensors = self.sensors();
        let pings = sensors.iter().map(|sensor| {
            let sensor = sensor.clone();
            tokio::task::spawn_blocking(move || sensor.ping())
        });
        let results = join_all(pings).await;

        let mut health = Vec::with_capacity(sensors.len());
        let mut unhealthy = Vec::new();
        for (sensor, result) in sensors.into_iter().zip(results) {
            let healthy = result.unwrap_or(false);
            health.push(SensorHealth {
                uuid: sensor.identity().uuid_string(),
                name: sensor.identity().name.clone(),
                healthy,
            });
            if !healthy {
                warn!(
                    "[Coordinator] Sensor {} failed its health check, detaching",
                    sensor.identity().name
                );
                unhealthy.push(sensor);
            }
        }

        if !unhealthy.is_empty() {
            self.request(|reply| Request::DetachSensors {
                sensors: unhealthy,
                reply,
            })
            .await?;
        }
        Ok(health)
    }

    /// Remove every sensor and stop the service loop.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Request::Shutdown { reply }).await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(build(reply))
            .await
            .map_err(|_| BridgeError::CoordinatorStopped)?;
        response.await.map_err(|_| BridgeError::CoordinatorStopped)
    }
}

struct ServiceLoop {
    requests: mpsc::Receiver<Request>,
    links: Vec<SensorLink>,
    registry: SensorRegistry,
    listen_address: Arc<RwLock<Option<String>>>,
    transport: Arc<dyn Transport>,
    announcer: Arc<dyn Announcer>,
    addresses: AddressSource,
    notifier: ReadyNotifier,
    config: CoordinatorConfig,
}

impl ServiceLoop {
    async fn run(mut self) {
        info!("[Coordinator] Service loop started");

        loop {
            while let Ok(request) = self.requests.try_recv() {
                if self.handle(request).await.is_break() {
                    return;
                }
            }

            if self.service_cycle().await {
                tokio::task::yield_now().await;
                continue;
            }

            let notifier = self.notifier.clone();
            let idle = self.config.idle_poll;
            let woken_by = tokio::select! {
                request = self.requests.recv() => Some(request),
                _ = notifier.notified() => None,
                _ = tokio::time::sleep(idle) => None,
            };

            match woken_by {
                Some(Some(request)) => {
                    if self.handle(request).await.is_break() {
                        return;
                    }
                }
                Some(None) => {
                    info!("[Coordinator] All handles dropped, stopping");
                    self.remove_all().await;
                    return;
                }
                None => {}
            }
        }
    }

    /// One pass over every sensor. Returns whether any had work.
    async fn service_cycle(&mut self) -> bool {
        let mut busy = false;
        for link in &mut self.links {
            if link.poll_commands().await > 0 {
                busy = true;
            }
            if link.has_frame() {
                busy = true;
                if let Err(e) = link.publish_frame().await {
                    warn!("[Coordinator] {}: Failed to publish frame: {}", link.uuid(), e);
                }
            }
            link.send_updated_controls().await;
        }
        busy
    }

    async fn handle(&mut self, request: Request) -> ControlFlow<()> {
        match request {
            Request::AddSensor { sensor, reply } => {
                let _ = reply.send(self.add_sensor(sensor).await);
            }
            Request::RemoveAll { reply } => {
                let _ = reply.send(self.remove_all().await);
            }
            Request::ResetNetwork { soft, reply } => {
                let _ = reply.send(self.reset_network(soft).await);
            }
            Request::AddressChanged { reply } => {
                let _ = reply.send(self.address_changed().await);
            }
            Request::DetachSensors { sensors, reply } => {
                let mut detached = 0;
                for sensor in sensors {
                    if self.detach(&sensor).await {
                        detached += 1;
                    }
                }
                let _ = reply.send(detached);
            }
            Request::Shutdown { reply } => {
                self.remove_all().await;
                info!("[Coordinator] Service loop stopped");
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn set_listen_address(&mut self, address: Option<String>) {
        *self.listen_address.write() = address;
    }

    fn current_address(&self) -> Option<String> {
        self.listen_address.read().clone()
    }

    fn ensure_listen_address(&mut self) -> Result<String> {
        if let Some(address) = self.current_address() {
            return Ok(address);
        }
        let address = self.addresses.resolve().ok_or(BridgeError::NoListenAddress)?;
        info!("[Coordinator] Listening on {}", address);
        self.set_listen_address(Some(address.clone()));
        Ok(address)
    }

    async fn add_sensor(&mut self, sensor: Arc<dyn Sensor>) -> Result<SensorAttach> {
        let address = self.ensure_listen_address()?;
        let uuid = sensor.identity().uuid;

        let existing = self
            .links
            .iter()
            .position(|l| l.sensor().identity().uuid == uuid);
        if let Some(index) = existing {
            if Arc::ptr_eq(self.links[index].sensor(), &sensor) {
                return self.links[index]
                    .attach_descriptor()
                    .ok_or(BridgeError::NotBound);
            }
            // Same device reopened through a new handle; the old one is stale.
            warn!("[Coordinator] Sensor {} attached again, replacing it", uuid);
            let mut old = self.links.remove(index);
            self.announcer.detach(old.uuid());
            old.unlink().await;
            self.registry.write().remove(&uuid);
        }

        let mut link = SensorLink::new(
            sensor.clone(),
            self.config.frame_wait,
            self.config.bind_timeout,
        );
        link.setup_sockets(self.transport.as_ref(), &address).await?;
        let descriptor = link.attach_descriptor().ok_or(BridgeError::NotBound)?;

        self.announcer.attach(&descriptor);
        info!(
            "[Coordinator] Sensor {} attached ({})",
            descriptor.name, descriptor.uuid
        );
        self.registry.write().insert(uuid, sensor);
        self.links.push(link);
        Ok(descriptor)
    }

    /// Detach `sensor` if it is still the one attached under its UUID.
    /// Its hardware is released in the background.
    async fn detach(&mut self, sensor: &Arc<dyn Sensor>) -> bool {
        let found = self
            .links
            .iter()
            .position(|l| Arc::ptr_eq(l.sensor(), sensor));
        let Some(index) = found else {
            return false;
        };
        let mut link = self.links.remove(index);
        self.announcer.detach(link.uuid());
        link.unlink().await;
        self.registry.write().remove(&sensor.identity().uuid);
        true
    }

    /// Detach everything and wait until every sensor's hardware is released.
    async fn remove_all(&mut self) -> usize {
        let links = std::mem::take(&mut self.links);
        let count = links.len();
        let mut releases = Vec::with_capacity(count);
        for mut link in links {
            self.announcer.detach(link.uuid());
            releases.extend(link.unlink().await);
        }
        self.registry.write().clear();
        join_all(releases).await;
        if count > 0 {
            info!("[Coordinator] Removed {} sensor(s)", count);
        }
        count
    }

    async fn reset_network(&mut self, soft: bool) -> Result<()> {
        info!(
            "[Coordinator] {} network reset",
            if soft { "Soft" } else { "Hard" }
        );
        if let Some(address) = self.addresses.resolve() {
            self.set_listen_address(Some(address));
        }
        let address = self.current_address().ok_or(BridgeError::NoListenAddress)?;

        if soft {
            self.rebind_all(&address).await
        } else {
            self.recreate_all(&address).await
        }
    }

    /// Rebind in place; sockets of a sensor that fails to rebind stay open.
    async fn rebind_all(&mut self, address: &str) -> Result<()> {
        let mut first_error = None;
        for link in &mut self.links {
            match link.setup_sockets(self.transport.as_ref(), address).await {
                Ok(()) => {
                    if let Some(descriptor) = link.attach_descriptor() {
                        self.announcer.attach(&descriptor);
                    }
                }
                Err(e) => {
                    error!("[Coordinator] Failed to rebind {}: {}", link.uuid(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Tear every link down and build a fresh one around the same sensor.
    /// Sensors whose new link cannot bind are released.
    async fn recreate_all(&mut self, address: &str) -> Result<()> {
        let mut first_error = None;
        for mut old in std::mem::take(&mut self.links) {
            self.announcer.detach(old.uuid());
            old.close().await;

            let sensor = old.sensor().clone();
            let mut link = SensorLink::new(
                sensor.clone(),
                self.config.frame_wait,
                self.config.bind_timeout,
            );
            match link.setup_sockets(self.transport.as_ref(), address).await {
                Ok(()) => {
                    if let Some(descriptor) = link.attach_descriptor() {
                        self.announcer.attach(&descriptor);
                    }
                    self.links.push(link);
                }
                Err(e) => {
                    error!("[Coordinator] Failed to recreate {}: {}", old.uuid(), e);
                    spawn_release(sensor.clone());
                    self.registry.write().remove(&sensor.identity().uuid);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn address_changed(&mut self) -> Result<bool> {
        let Some(address) = self.addresses.resolve() else {
            warn!("[Coordinator] No listen address available, keeping current sockets");
            return Ok(false);
        };
        if self.current_address().as_deref() == Some(address.as_str()) {
            debug!("[Coordinator] Listen address unchanged ({})", address);
            return Ok(false);
        }

        info!("[Coordinator] Listen address changed to {}", address);
        self.set_listen_address(Some(address.clone()));
        self.rebind_all(&address).await?;
        Ok(true)
    }
}
