//! INDI client session
//!
//! One session owns one byte stream to an INDI server and two tasks:
//!
//! - the **writer** drains the outgoing queue, so every command is written
//!   as one complete element and commands never interleave on the wire;
//! - the **reader** decodes incoming messages, dispatches them through the
//!   registry, publishes the resulting events and sends follow-up commands.
//!
//! When the stream ends, fails or the session is closed, every device is
//! detached (in name order) before the event bus is closed, so pending waits
//! see `Detached` and subscribers see the device go away.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::camera::IndiCamera;
use crate::classify::{DefaultClassifier, DeviceClassifier};
use crate::codec::{Decoded, MessageReader};
use crate::config::IndiConfig;
use crate::encode::encode;
use crate::error::{IndiError, IndiResult};
use crate::event::{DeviceEvent, DeviceRef, DeviceSubscription, DomainEvent, EventBus};
use crate::filterwheel::IndiFilterWheel;
use crate::focuser::IndiFocuser;
use crate::message::{GetProperties, Message};
use crate::mount::IndiMount;
use crate::registry::Registry;
use crate::transport::{TcpTransport, Transport};

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// [`Session::close`] was called or the session was dropped
    LocalClose,
    /// The server closed the stream
    EndOfStream,
    TransportError(String),
}

/// A live connection to an INDI server
pub struct Session {
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    outbox: mpsc::Sender<Message>,
    config: Arc<IndiConfig>,
    shutdown: watch::Sender<bool>,
    closed: watch::Receiver<Option<CloseReason>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Connect over TCP to `config.host:config.port`
    pub async fn open(config: IndiConfig) -> IndiResult<Self> {
        Self::open_with(&TcpTransport, config, Arc::new(DefaultClassifier::new())).await
    }

    /// Connect through a custom transport and classifier
    pub async fn open_with(
        transport: &dyn Transport,
        config: IndiConfig,
        classifier: Arc<dyn DeviceClassifier>,
    ) -> IndiResult<Self> {
        let stream = transport.connect(&config).await?;
        Self::from_stream_with(stream, config, classifier).await
    }

    /// Run a session over an already open stream
    pub async fn from_stream<S>(stream: S, config: IndiConfig) -> IndiResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::from_stream_with(stream, config, Arc::new(DefaultClassifier::new())).await
    }

    pub async fn from_stream_with<S>(
        stream: S,
        config: IndiConfig,
        classifier: Arc<dyn DeviceClassifier>,
    ) -> IndiResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = Arc::new(config);
        let bus = Arc::new(EventBus::new(config.event_capacity));
        let (outbox, rx) = mpsc::channel(config.writer_queue_capacity.max(1));
        let registry = Arc::new(Registry::new(
            classifier,
            outbox.clone(),
            bus.clone(),
            config.clone(),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (closed_tx, closed) = watch::channel(None);

        let (read_half, write_half) = tokio::io::split(stream);
        tokio::spawn(writer_task(write_half, rx, shutdown_rx.clone()));
        let reader = tokio::spawn(reader_task(
            MessageReader::with_config(read_half, &config),
            registry.clone(),
            bus.clone(),
            outbox.clone(),
            shutdown_rx,
            closed_tx,
        ));

        let session = Self {
            registry,
            bus,
            outbox,
            config,
            shutdown,
            closed,
            reader: Mutex::new(Some(reader)),
        };

        // Request device list with configured protocol version
        session
            .send(Message::GetProperties(GetProperties {
                version: Some(session.config.protocol_version.clone()),
                device: None,
                name: None,
            }))
            .await?;
        tracing::info!("INDI session opened ({})", session.config.address());
        Ok(session)
    }

    pub fn config(&self) -> &IndiConfig {
        &self.config
    }

    /// Queue a raw message for the server
    pub async fn send(&self, message: Message) -> IndiResult<()> {
        if self.is_closed() {
            return Err(IndiError::SessionClosed);
        }
        self.outbox
            .send(message)
            .await
            .map_err(|_| IndiError::ChannelClosed("INDI writer stopped".to_string()))
    }

    /// Ask the server to re-send every definition
    pub async fn request_properties(&self) -> IndiResult<()> {
        self.send(Message::GetProperties(GetProperties {
            version: Some(self.config.protocol_version.clone()),
            device: None,
            name: None,
        }))
        .await
    }

    /// Protocol version the server announced, if any
    pub fn server_version(&self) -> Option<String> {
        self.registry.server_version()
    }

    pub fn device(&self, name: &str) -> Option<DeviceRef> {
        self.registry.device(name)
    }

    /// Attached devices sorted by name
    pub fn devices(&self) -> Vec<DeviceRef> {
        self.registry.devices()
    }

    pub fn mount(&self, name: &str) -> Option<IndiMount> {
        self.device(name).as_ref().and_then(IndiMount::from_device)
    }

    pub fn focuser(&self, name: &str) -> Option<IndiFocuser> {
        self.device(name).as_ref().and_then(IndiFocuser::from_device)
    }

    pub fn filter_wheel(&self, name: &str) -> Option<IndiFilterWheel> {
        self.device(name).as_ref().and_then(IndiFilterWheel::from_device)
    }

    pub fn camera(&self, name: &str) -> Option<IndiCamera> {
        self.device(name).as_ref().and_then(IndiCamera::from_device)
    }

    /// Wait until the server has announced (and we classified) `name`
    pub async fn wait_for_device(&self, name: &str, wait: Duration) -> IndiResult<DeviceRef> {
        let mut events = self.bus.subscribe_device(name);
        if let Some(device) = self.device(name) {
            return Ok(device);
        }
        let attached = async {
            while let Some(event) = events.recv().await {
                if let DomainEvent::Device(device, DeviceEvent::Attached) = event {
                    return Ok(device);
                }
            }
            Err(IndiError::SessionClosed)
        };
        tokio::time::timeout(wait, attached)
            .await
            .map_err(|_| IndiError::OperationTimeout {
                operation: "device discovery".to_string(),
                device: name.to_string(),
                duration: wait,
            })?
    }

    /// Every event of the session
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.bus.subscribe()
    }

    pub fn subscribe_device(&self, name: &str) -> DeviceSubscription {
        self.bus.subscribe_device(name)
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// Why the session ended, `None` while it is running
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed.borrow().clone()
    }

    /// Resolves once the session has ended and every device is detached
    pub async fn closed(&self) -> CloseReason {
        let mut closed = self.closed.clone();
        loop {
            if let Some(reason) = closed.borrow_and_update().clone() {
                return reason;
            }
            if closed.changed().await.is_err() {
                return closed.borrow().clone().unwrap_or(CloseReason::LocalClose);
            }
        }
    }

    /// Stop both tasks, detach every device and close the event bus
    pub async fn close(&self) {
        tracing::info!("Closing INDI session ({})", self.config.address());
        let _ = self.shutdown.send(true);
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                tracing::error!("INDI reader task failed: {}", e);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Writer task - sends commands to INDI server
async fn writer_task<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let xml = encode(&message);
        tracing::debug!("INDI >> {}", xml.trim_end());
        if let Err(e) = writer.write_all(xml.as_bytes()).await {
            tracing::error!("INDI write error: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::error!("INDI write error: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Reader task - decodes, dispatches and publishes until the stream ends
async fn reader_task<R: AsyncRead + Unpin>(
    mut reader: MessageReader<R>,
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    outbox: mpsc::Sender<Message>,
    mut shutdown: watch::Receiver<bool>,
    closed: watch::Sender<Option<CloseReason>>,
) {
    let reason = loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break CloseReason::LocalClose,
            decoded = reader.next() => match decoded {
                Ok(Decoded::Message(message)) => {
                    let out = registry.dispatch(message);
                    for event in out.events {
                        bus.publish(event);
                    }
                    for event in out.replies {
                        bus.notify_waiters(event);
                    }
                    for follow_up in out.follow_ups {
                        if outbox.send(follow_up).await.is_err() {
                            tracing::debug!("Dropping follow-up command, writer stopped");
                        }
                    }
                }
                Ok(Decoded::Malformed(e)) => {
                    tracing::warn!("Discarding malformed INDI input: {}", e);
                }
                Ok(Decoded::EndOfStream) => break CloseReason::EndOfStream,
                Err(e) => {
                    tracing::error!("INDI read error: {}", e);
                    break CloseReason::TransportError(e.to_string());
                }
            },
        }
    };

    for event in registry.detach_all().events {
        bus.publish(event);
    }
    bus.close();
    tracing::info!("INDI session closed: {:?}", reason);
    let _ = closed.send(Some(reason));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::focuser::FocuserEvent;
    use crate::message::NewVector;
    use crate::sync::{CancellationToken, FailureReason, WaitOutcome};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    const WAIT: Duration = Duration::from_secs(5);

    const FOCUSER_DEFS: &str = r#"
<defNumberVector device="Focuser Simulator" name="ABS_FOCUS_POSITION" label="Absolute Position"
    group="Main Control" state="Ok" perm="rw" timeout="60">
  <defNumber name="FOCUS_ABSOLUTE_POSITION" format="%6.0f" min="0" max="50000" step="1000">10000</defNumber>
</defNumberVector>
<defTextVector device="Focuser Simulator" name="DRIVER_INFO" state="Idle" perm="ro">
  <defText name="DRIVER_NAME">Focuser Simulator</defText>
  <defText name="DRIVER_EXEC">indi_simulator_focus</defText>
  <defText name="DRIVER_INTERFACE">8</defText>
</defTextVector>
"#;

    /// The server end of an in-memory connection
    struct FakeServer {
        reader: MessageReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn next(&mut self) -> Message {
            match self.reader.next().await.unwrap() {
                Decoded::Message(message) => message,
                other => panic!("expected a message, got {:?}", other),
            }
        }

        async fn send(&mut self, xml: &str) {
            self.writer.write_all(xml.as_bytes()).await.unwrap();
        }
    }

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    async fn connect() -> (Session, FakeServer) {
        init_logging();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let session = Session::from_stream(client, IndiConfig::default())
            .await
            .unwrap();
        let (read, write) = tokio::io::split(server);
        let mut server = FakeServer {
            reader: MessageReader::new(read, 1 << 20, 4096),
            writer: write,
        };
        assert_eq!(
            server.next().await,
            Message::GetProperties(GetProperties {
                version: Some("1.7".to_string()),
                device: None,
                name: None,
            })
        );
        (session, server)
    }

    #[tokio::test]
    async fn test_focuser_move_over_the_wire() {
        let (session, mut server) = connect().await;
        server.send(FOCUSER_DEFS).await;
        session.wait_for_device("Focuser Simulator", WAIT).await.unwrap();
        let focuser = session.focuser("Focuser Simulator").unwrap();
        let mut telemetry = session.subscribe_device("Focuser Simulator");

        let task = {
            let focuser = focuser.clone();
            tokio::spawn(async move {
                focuser
                    .move_to_and_wait(12345.0, &CancellationToken::new())
                    .await
            })
        };

        assert_eq!(
            server.next().await,
            Message::NewVector(NewVector::number(
                "Focuser Simulator",
                "ABS_FOCUS_POSITION",
                "FOCUS_ABSOLUTE_POSITION",
                12345.0
            ))
        );
        server
            .send(
                r#"<setNumberVector device="Focuser Simulator" name="ABS_FOCUS_POSITION" state="Busy">
                    <oneNumber name="FOCUS_ABSOLUTE_POSITION">11000</oneNumber></setNumberVector>
                <setNumberVector device="Focuser Simulator" name="ABS_FOCUS_POSITION" state="Ok">
                    <oneNumber name="FOCUS_ABSOLUTE_POSITION">12345</oneNumber></setNumberVector>"#,
            )
            .await;

        let outcome = tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome, WaitOutcome::Success);
        assert_eq!(focuser.position(), 12345.0);

        let mut focuser_events = Vec::new();
        while focuser_events.len() < 4 {
            match telemetry.recv().await {
                Some(DomainEvent::Focuser(_, event)) => focuser_events.push(event),
                Some(_) => {}
                None => break,
            }
        }
        assert_eq!(
            focuser_events,
            vec![
                FocuserEvent::PositionChanged(11000.0),
                FocuserEvent::MovingChanged(true),
                FocuserEvent::PositionChanged(12345.0),
                FocuserEvent::MovingChanged(false),
            ]
        );
    }

    #[tokio::test]
    async fn test_garbage_does_not_end_the_session() {
        let (session, mut server) = connect().await;
        server.send("hello there </stray> more junk\n").await;
        server.send(FOCUSER_DEFS).await;
        let device = session.wait_for_device("Focuser Simulator", WAIT).await.unwrap();
        assert!(device.has_property("ABS_FOCUS_POSITION"));
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_connect_queues_device_refresh() {
        let (session, mut server) = connect().await;
        server
            .send(
                r#"<defSwitchVector device="CCD Simulator" name="CONNECTION" state="Idle" perm="rw" rule="OneOfMany">
                    <defSwitch name="CONNECT">Off</defSwitch><defSwitch name="DISCONNECT">On</defSwitch>
                </defSwitchVector>
                <defNumberVector device="CCD Simulator" name="CCD_EXPOSURE" state="Idle" perm="rw">
                    <defNumber name="CCD_EXPOSURE_VALUE" min="0" max="3600">1</defNumber>
                </defNumberVector>"#,
            )
            .await;
        let device = session.wait_for_device("CCD Simulator", WAIT).await.unwrap();
        let connect = {
            let device = device.clone();
            tokio::spawn(async move {
                device
                    .connect_and_wait(Some(WAIT), &CancellationToken::new())
                    .await
            })
        };
        assert!(matches!(server.next().await, Message::NewVector(v) if v.name == "CONNECTION"));
        server
            .send(
                r#"<setSwitchVector device="CCD Simulator" name="CONNECTION" state="Ok">
                    <oneSwitch name="CONNECT">On</oneSwitch><oneSwitch name="DISCONNECT">Off</oneSwitch>
                </setSwitchVector>"#,
            )
            .await;
        assert_eq!(connect.await.unwrap().unwrap(), WaitOutcome::Success);
        assert_eq!(
            server.next().await,
            Message::GetProperties(GetProperties {
                version: Some("1.7".to_string()),
                device: Some("CCD Simulator".to_string()),
                name: None,
            })
        );
        assert!(session.camera("CCD Simulator").is_some());
    }

    #[tokio::test]
    async fn test_device_deletion_releases_waits() {
        let (session, mut server) = connect().await;
        server.send(FOCUSER_DEFS).await;
        session.wait_for_device("Focuser Simulator", WAIT).await.unwrap();
        let focuser = session.focuser("Focuser Simulator").unwrap();

        let task = {
            let focuser = focuser.clone();
            tokio::spawn(async move {
                focuser
                    .move_to_and_wait(500.0, &CancellationToken::new())
                    .await
            })
        };
        server.next().await;
        server.send(r#"<delProperty device="Focuser Simulator"/>"#).await;

        let outcome = tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome, WaitOutcome::Failure(FailureReason::Detached));
        assert!(session.device("Focuser Simulator").is_none());
        assert!(matches!(
            focuser.move_to(100.0).await,
            Err(IndiError::Detached(_))
        ));
    }

    #[tokio::test]
    async fn test_close_detaches_everything() {
        let (session, mut server) = connect().await;
        server.send(FOCUSER_DEFS).await;
        server
            .send(&FOCUSER_DEFS.replace("Focuser Simulator", "Alpha Focuser"))
            .await;
        session.wait_for_device("Focuser Simulator", WAIT).await.unwrap();
        session.wait_for_device("Alpha Focuser", WAIT).await.unwrap();

        let mut events = session.subscribe();
        session.close().await;

        let mut detached = Vec::new();
        loop {
            match events.recv().await {
                Ok(DomainEvent::Device(device, DeviceEvent::Detached)) => {
                    detached.push(device.name().to_string())
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        assert_eq!(detached, vec!["Alpha Focuser", "Focuser Simulator"]);
        assert_eq!(session.closed().await, CloseReason::LocalClose);
        assert!(session.devices().is_empty());
        assert!(matches!(
            session.request_properties().await,
            Err(IndiError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_server_hangup() {
        let (session, server) = connect().await;
        let waiter_bus = session.bus().clone();
        drop(server);
        assert_eq!(
            tokio::time::timeout(WAIT, session.closed()).await.unwrap(),
            CloseReason::EndOfStream
        );
        assert!(waiter_bus.is_closed());
    }
}
