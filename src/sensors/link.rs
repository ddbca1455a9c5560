//! Network side of a sensor: its three sockets and the traffic on them.
//!
//! ```text
//! Unbound --setup_sockets--> Bound --setup_sockets--> Rebinding --> Bound
//!    \                         |
//!     `------- unlink/close ---+--> Closed
//! ```
//!
//! Sequence counters live here, so they survive a rebind and restart from
//! zero only when a new link is created for the sensor.

use super::{ControlUpdate, Frame, Sensor};
use crate::error::{BridgeError, Result};
use crate::ndsi::messages::{frame_message, notification_message};
use crate::ndsi::{
    Bound, CommandSocket, FrameHeader, PublishSocket, SensorAttach, SensorCommand, Transport,
    UpdateControlMessage,
};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unbound,
    Bound,
    Rebinding,
    Closed,
}

struct Sockets {
    data: Box<dyn PublishSocket>,
    data_url: String,
    note: Box<dyn PublishSocket>,
    note_url: String,
    cmd: Box<dyn CommandSocket>,
    cmd_url: String,
}

impl Sockets {
    async fn bind(transport: &dyn Transport, listen_address: &str) -> Result<Self> {
        let data = transport.bind_publisher(listen_address).await?;
        let note = match transport.bind_publisher(listen_address).await {
            Ok(note) => note,
            Err(e) => {
                data.socket.close().await;
                return Err(e);
            }
        };
        let cmd = match transport.bind_command(listen_address).await {
            Ok(cmd) => cmd,
            Err(e) => {
                data.socket.close().await;
                note.socket.close().await;
                return Err(e);
            }
        };

        let Bound { socket: data, url: data_url } = data;
        let Bound { socket: note, url: note_url } = note;
        let Bound { socket: cmd, url: cmd_url } = cmd;
        Ok(Self {
            data,
            data_url,
            note,
            note_url,
            cmd,
            cmd_url,
        })
    }

    async fn close(self) {
        self.data.close().await;
        self.note.close().await;
        self.cmd.close().await;
    }
}

pub struct SensorLink {
    sensor: Arc<dyn Sensor>,
    uuid: String,
    sockets: Option<Sockets>,
    state: LinkState,
    data_sequence: u32,
    note_sequence: u64,
    frame_wait: Duration,
    bind_timeout: Duration,
}

impl SensorLink {
    pub fn new(sensor: Arc<dyn Sensor>, frame_wait: Duration, bind_timeout: Duration) -> Self {
        let uuid = sensor.identity().uuid_string();
        Self {
            sensor,
            uuid,
            sockets: None,
            state: LinkState::Unbound,
            data_sequence: 0,
            note_sequence: 0,
            frame_wait,
            bind_timeout,
        }
    }

    pub fn sensor(&self) -> &Arc<dyn Sensor> {
        &self.sensor
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Index the next published frame will carry.
    pub fn data_sequence(&self) -> u32 {
        self.data_sequence
    }

    pub fn note_sequence(&self) -> u64 {
        self.note_sequence
    }

    /// Bind fresh sockets on `listen_address`. Existing sockets stay open
    /// until the new ones are bound, and are kept if binding fails.
    pub async fn setup_sockets(
        &mut self,
        transport: &dyn Transport,
        listen_address: &str,
    ) -> Result<()> {
        if self.state == LinkState::Closed {
            return Err(BridgeError::LinkClosed);
        }
        debug!("setup_sockets() sensor_uuid={}", self.uuid);

        let previous_state = self.state;
        if previous_state == LinkState::Bound {
            self.state = LinkState::Rebinding;
        }

        let bound = tokio::time::timeout(
            self.bind_timeout,
            Sockets::bind(transport, listen_address),
        )
        .await;

        let sockets = match bound {
            Ok(Ok(sockets)) => sockets,
            Ok(Err(e)) => {
                self.state = previous_state;
                return Err(e);
            }
            Err(_) => {
                self.state = previous_state;
                return Err(BridgeError::BindTimeout(self.bind_timeout));
            }
        };

        info!(
            "Sensor {} bound: data={} notify={} command={}",
            self.sensor.identity().name,
            sockets.data_url,
            sockets.note_url,
            sockets.cmd_url
        );

        let old = self.sockets.replace(sockets);
        self.state = LinkState::Bound;
        if let Some(old) = old {
            old.close().await;
        }
        Ok(())
    }

    /// Descriptor for the discovery collaborator, once bound.
    pub fn attach_descriptor(&self) -> Option<SensorAttach> {
        let sockets = self.sockets.as_ref()?;
        let identity = self.sensor.identity();
        Some(SensorAttach {
            name: identity.name.clone(),
            uuid: self.uuid.clone(),
            sensor_type: identity.sensor_type.clone(),
            notification_url: sockets.note_url.clone(),
            command_url: sockets.cmd_url.clone(),
            data_url: sockets.data_url.clone(),
        })
    }

    /// Handle every command currently pending, without waiting for more.
    /// Malformed or unknown commands are logged and dropped. Returns how many
    /// messages were taken off the socket.
    pub async fn poll_commands(&mut self) -> usize {
        let Some(sockets) = self.sockets.as_mut() else {
            return 0;
        };

        let mut pending = Vec::new();
        loop {
            match sockets.cmd.try_recv() {
                Ok(Some(parts)) => pending.push(parts),
                Ok(None) => break,
                Err(e) => {
                    warn!("{}: {}", self.uuid, e);
                    break;
                }
            }
        }

        let received = pending.len();
        for parts in pending {
            let command = match SensorCommand::from_parts(&parts) {
                Ok(command) => command,
                Err(e) => {
                    warn!("Dropping command for {}: {}", self.uuid, e);
                    continue;
                }
            };
            debug!("cmd socket command = {:?}", command);

            let updates = match command {
                SensorCommand::RefreshControls => self.sensor.refresh_controls(),
                SensorCommand::SetControlValue { control_id, value } => self
                    .sensor
                    .set_control_value(&control_id, value)
                    .into_iter()
                    .collect(),
            };
            self.send_control_updates(updates).await;
        }
        received
    }

    pub fn has_frame(&self) -> bool {
        self.sensor.has_frame()
    }

    /// Wait briefly for the sensor's next frame and publish it. Returns
    /// `Ok(false)` when no frame arrived in time.
    pub async fn publish_frame(&mut self) -> Result<bool> {
        match self.sensor.next_frame(self.frame_wait).await {
            Some(frame) => {
                self.send_frame(frame).await?;
                Ok(true)
            }
            None => {
                warn!("{}: Timed out waiting for data", self.sensor.identity().name);
                Ok(false)
            }
        }
    }

    /// Publish a frame under the next sequence number. The header's data
    /// length is always taken from the payload being sent.
    pub async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let sockets = self.sockets.as_mut().ok_or(BridgeError::NotBound)?;

        let header = FrameHeader::for_payload(
            frame.flag,
            self.sensor.width(),
            self.sensor.height(),
            self.data_sequence,
            frame.timestamp,
            frame.extra,
            &frame.payload,
        );
        self.data_sequence = self.data_sequence.wrapping_add(1);

        sockets
            .data
            .send(frame_message(&self.uuid, &header, frame.payload))
            .await
    }

    /// Resend the state of every control.
    pub async fn refresh_controls(&mut self) -> usize {
        let updates = self.sensor.refresh_controls();
        self.send_control_updates(updates).await
    }

    /// Publish the controls whose group was marked dirty since the last call.
    pub async fn send_updated_controls(&mut self) -> usize {
        let updates = self.sensor.take_updated_controls();
        if updates.is_empty() {
            return 0;
        }
        self.send_control_updates(updates).await
    }

    async fn send_control_updates(&mut self, updates: Vec<ControlUpdate>) -> usize {
        let Some(sockets) = self.sockets.as_mut() else {
            debug!("Dropping {} control update(s), sockets not bound", updates.len());
            return 0;
        };

        let mut sent = 0;
        for update in updates {
            let message = UpdateControlMessage::update(
                update.control_id,
                self.note_sequence,
                update.changes,
            );
            self.note_sequence += 1;

            let parts = match notification_message(&self.uuid, &message) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!("Failed to encode {} update: {}", message.control_id, e);
                    continue;
                }
            };
            match sockets.note.send(parts).await {
                Ok(()) => sent += 1,
                Err(e) => warn!("Failed to publish {} update: {}", message.control_id, e),
            }
        }
        sent
    }

    /// Close the sockets but keep the hardware; the link cannot be rebound.
    pub async fn close(&mut self) {
        if let Some(sockets) = self.sockets.take() {
            sockets.close().await;
        }
        self.state = LinkState::Closed;
    }

    /// Close the sockets and release the sensor's hardware on the blocking
    /// pool. The returned task finishes once the hardware is released.
    pub async fn unlink(&mut self) -> Option<JoinHandle<()>> {
        let was_closed = self.state == LinkState::Closed;
        self.close().await;
        info!("Sensor {} unlinked", self.sensor.identity().name);
        (!was_closed).then(|| spawn_release(self.sensor.clone()))
    }
}

/// Release a sensor's hardware without blocking the calling task.
pub fn spawn_release(sensor: Arc<dyn Sensor>) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || sensor.release())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ndsi::transport::memory::MemoryTransport;
    use crate::ndsi::{ControlValue, FLAG_ALL, HEADER_LEN};
    use crate::sensors::{ControlHandle, ControlRegistry, IntRange, SensorIdentity};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Minimal sensor with an `exposure_time` control and a frame list.
    pub(crate) struct StubSensor {
        identity: SensorIdentity,
        controls: ControlRegistry<StubSensor>,
        exposure: ControlHandle,
        pub applied: Mutex<Vec<i64>>,
        pub frames: Mutex<VecDeque<Frame>>,
        pub released: AtomicBool,
        pub healthy: AtomicBool,
        pub ping_delay: Mutex<Duration>,
    }

    impl StubSensor {
        pub(crate) fn new(device_id: &str) -> Self {
            let mut controls = ControlRegistry::new();
            let exposure = controls.register_int_control(
                "exposure_time",
                "Exposure time",
                100,
                IntRange::new(1, 2000, 1),
                Some(Box::new(|sensor: &StubSensor, value: i64| {
                    sensor.applied.lock().push(value);
                    sensor.controls.set(sensor.exposure, value);
                })),
            );
            Self {
                identity: SensorIdentity::from_device_id(device_id, device_id, "stub"),
                controls,
                exposure,
                applied: Mutex::new(Vec::new()),
                frames: Mutex::new(VecDeque::new()),
                released: AtomicBool::new(false),
                healthy: AtomicBool::new(true),
                ping_delay: Mutex::new(Duration::ZERO),
            }
        }

        pub(crate) fn push_frame(&self, payload: &'static [u8]) {
            self.frames.lock().push_back(Frame {
                flag: FLAG_ALL,
                timestamp: 12.5,
                extra: 7,
                payload: Bytes::from_static(payload),
            });
        }

        pub(crate) fn set_exposure(&self, value: i64) {
            self.controls.set(self.exposure, value);
        }
    }

    #[async_trait]
    impl Sensor for StubSensor {
        fn identity(&self) -> &SensorIdentity {
            &self.identity
        }

        fn width(&self) -> u32 {
            4
        }

        fn height(&self) -> u32 {
            2
        }

        fn has_frame(&self) -> bool {
            !self.frames.lock().is_empty()
        }

        async fn next_frame(&self, wait: Duration) -> Option<Frame> {
            let frame = self.frames.lock().pop_front();
            if frame.is_none() {
                tokio::time::sleep(wait).await;
            }
            frame
        }

        fn ping(&self) -> bool {
            let delay = *self.ping_delay.lock();
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            self.healthy.load(Ordering::SeqCst)
        }

        fn refresh_controls(&self) -> Vec<ControlUpdate> {
            self.controls.refresh_controls(self)
        }

        fn set_control_value(&self, control_id: &str, value: ControlValue) -> Option<ControlUpdate> {
            self.controls.set_control_value(self, control_id, value)
        }

        fn take_updated_controls(&self) -> Vec<ControlUpdate> {
            self.controls.take_updated_controls(self)
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn link_for(sensor: &Arc<StubSensor>) -> SensorLink {
        SensorLink::new(sensor.clone(), Duration::from_millis(200), Duration::from_secs(5))
    }

    fn json(part: &Bytes) -> serde_json::Value {
        serde_json::from_slice(part).unwrap()
    }

    #[tokio::test]
    async fn test_setup_sockets_binds_three_sockets() {
        let transport = MemoryTransport::new();
        let sensor = Arc::new(StubSensor::new("cam-1"));
        let mut link = link_for(&sensor);
        assert_eq!(link.state(), LinkState::Unbound);
        assert!(link.attach_descriptor().is_none());

        link.setup_sockets(&transport, "10.0.0.5").await.unwrap();
        let attach = link.attach_descriptor().unwrap();

        assert_eq!(link.state(), LinkState::Bound);
        assert_eq!(attach.uuid, sensor.identity().uuid_string());
        assert_eq!(attach.sensor_type, "stub");
        for url in [&attach.data_url, &attach.notification_url, &attach.command_url] {
            assert!(url.starts_with("tcp://10.0.0.5:"), "{}", url);
        }
        assert_ne!(attach.data_url, attach.notification_url);
    }

    #[tokio::test]
    async fn test_set_control_value_command_emits_one_notification() {
        let transport = MemoryTransport::new();
        let sensor = Arc::new(StubSensor::new("cam-1"));
        let mut link = link_for(&sensor);
        link.setup_sockets(&transport, "127.0.0.1").await.unwrap();
        let attach = link.attach_descriptor().unwrap();

        transport.push_command(
            &attach.command_url,
            vec![
                Bytes::from(attach.uuid.clone()),
                Bytes::from_static(
                    br#"{"action":"set_control_value","control_id":"exposure_time","value":500}"#,
                ),
            ],
        );
        assert_eq!(link.poll_commands().await, 1);
        link.send_updated_controls().await;

        let published = transport.published(&attach.notification_url);
        assert_eq!(published.len(), 1);
        assert_eq!(&published[0][0][..], attach.uuid.as_bytes());
        let body = json(&published[0][1]);
        assert_eq!(body["subject"], "update");
        assert_eq!(body["control_id"], "exposure_time");
        assert_eq!(body["seq"], 0);
        assert_eq!(body["changes"]["value"], 500);
        assert_eq!(*sensor.applied.lock(), vec![500]);
    }

    #[tokio::test]
    async fn test_bad_commands_are_dropped() {
        let transport = MemoryTransport::new();
        let sensor = Arc::new(StubSensor::new("cam-1"));
        let mut link = link_for(&sensor);
        link.setup_sockets(&transport, "127.0.0.1").await.unwrap();
        let attach = link.attach_descriptor().unwrap();

        for body in [
            &b"garbage"[..],
            br#"{"action":"set_control_value","value":3}"#,
            br#"{"action":"set_control_value","control_id":"exposure_time","value":1.5}"#,
            br#"{"action":"set_control_value","control_id":"nope","value":3}"#,
            br#"{"action":"explode"}"#,
            br#"{"action":"refresh_controls"}"#,
        ] {
            transport.push_command(
                &attach.command_url,
                vec![Bytes::from(attach.uuid.clone()), Bytes::copy_from_slice(body)],
            );
        }
        transport.push_command(&attach.command_url, vec![Bytes::from_static(b"only-uuid")]);

        assert_eq!(link.poll_commands().await, 7);
        assert_eq!(link.poll_commands().await, 0);

        let published = transport.published(&attach.notification_url);
        assert_eq!(published.len(), 1);
        assert_eq!(json(&published[0][1])["control_id"], "exposure_time");
        assert!(sensor.applied.lock().is_empty());
    }

    #[tokio::test]
    async fn test_send_updated_controls_twice() {
        let transport = MemoryTransport::new();
        let sensor = Arc::new(StubSensor::new("cam-1"));
        let mut link = link_for(&sensor);
        link.setup_sockets(&transport, "127.0.0.1").await.unwrap();

        sensor.set_exposure(900);
        assert_eq!(link.send_updated_controls().await, 1);
        assert_eq!(link.send_updated_controls().await, 0);
        assert_eq!(link.note_sequence(), 1);
    }

    #[tokio::test]
    async fn test_frame_sequence_and_header() {
        let transport = MemoryTransport::new();
        let sensor = Arc::new(StubSensor::new("cam-1"));
        let mut link = link_for(&sensor);
        link.setup_sockets(&transport, "127.0.0.1").await.unwrap();
        let data_url = link.attach_descriptor().unwrap().data_url;

        sensor.push_frame(b"first");
        sensor.push_frame(b"");
        assert!(link.has_frame());
        assert!(link.publish_frame().await.unwrap());
        assert!(link.publish_frame().await.unwrap());

        let published = transport.published(&data_url);
        assert_eq!(published.len(), 2);
        let first = FrameHeader::decode(&published[0][1]).unwrap();
        let second = FrameHeader::decode(&published[1][1]).unwrap();
        assert_eq!(published[0][1].len(), HEADER_LEN);
        assert_eq!((first.index, second.index), (0, 1));
        assert_eq!((first.width, first.height), (4, 2));
        assert_eq!(first.extra, 7);
        assert_eq!(first.data_length, 5);
        assert_eq!(second.data_length, 0);
        assert_eq!(&published[0][2][..], b"first");
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_frame_times_out_quietly() {
        let transport = MemoryTransport::new();
        let sensor = Arc::new(StubSensor::new("cam-1"));
        let mut link = link_for(&sensor);
        link.setup_sockets(&transport, "127.0.0.1").await.unwrap();
        let data_url = link.attach_descriptor().unwrap().data_url;

        assert!(!link.publish_frame().await.unwrap());
        assert!(transport.published(&data_url).is_empty());
        assert_eq!(link.data_sequence(), 0);
    }

    #[tokio::test]
    async fn test_rebind_keeps_sequence_and_closes_old_sockets() {
        let transport = MemoryTransport::new();
        let sensor = Arc::new(StubSensor::new("cam-1"));
        let mut link = link_for(&sensor);
        link.setup_sockets(&transport, "10.0.0.5").await.unwrap();
        let old = link.attach_descriptor().unwrap();

        sensor.push_frame(b"a");
        link.publish_frame().await.unwrap();

        link.setup_sockets(&transport, "10.0.0.6").await.unwrap();
        let new = link.attach_descriptor().unwrap();
        assert!(transport.is_closed(&old.data_url));
        assert!(transport.is_closed(&old.command_url));
        assert!(new.data_url.starts_with("tcp://10.0.0.6:"));

        sensor.push_frame(b"b");
        link.publish_frame().await.unwrap();
        let header = FrameHeader::decode(&transport.published(&new.data_url)[0][1]).unwrap();
        assert_eq!(header.index, 1);
    }

    #[tokio::test]
    async fn test_failed_rebind_keeps_old_sockets() {
        let transport = MemoryTransport::new();
        let sensor = Arc::new(StubSensor::new("cam-1"));
        let mut link = link_for(&sensor);
        link.setup_sockets(&transport, "10.0.0.5").await.unwrap();
        let old = link.attach_descriptor().unwrap();

        transport.set_fail_binds(true);
        assert!(link.setup_sockets(&transport, "10.0.0.6").await.is_err());
        assert_eq!(link.state(), LinkState::Bound);
        assert_eq!(link.attach_descriptor().unwrap(), old);
        assert!(!transport.is_closed(&old.data_url));
    }

    #[tokio::test]
    async fn test_unlink_closes_and_releases() {
        let transport = MemoryTransport::new();
        let sensor = Arc::new(StubSensor::new("cam-1"));
        let mut link = link_for(&sensor);
        link.setup_sockets(&transport, "127.0.0.1").await.unwrap();
        let attach = link.attach_descriptor().unwrap();

        let release = link.unlink().await.unwrap();
        release.await.unwrap();
        assert!(link.unlink().await.is_none());

        assert_eq!(link.state(), LinkState::Closed);
        assert!(sensor.released.load(Ordering::SeqCst));
        assert!(transport.is_closed(&attach.data_url));
        assert!(transport.is_closed(&attach.notification_url));
        assert!(transport.is_closed(&attach.command_url));
        assert!(matches!(
            link.setup_sockets(&transport, "127.0.0.1").await,
            Err(BridgeError::LinkClosed)
        ));
        assert!(matches!(
            link.send_frame(Frame {
                flag: FLAG_ALL,
                timestamp: 0.0,
                extra: 0,
                payload: Bytes::new(),
            })
            .await,
            Err(BridgeError::NotBound)
        ));
    }
}
