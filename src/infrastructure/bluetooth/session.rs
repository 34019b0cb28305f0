//! Hub Session Module
//!
//! Owns one hub connection from connect to teardown: applies the capability
//! descriptors, runs a single behavior routine, pumps sensor updates into
//! registered handlers and guards every actuator command on the session
//! state.

use crate::domain::models::{ConnectionState, HubDescriptor, HubRecord, SensorValue, SessionEvent};
use crate::error::HubError;
use crate::infrastructure::bluetooth::capability::{self, Capability};
use crate::infrastructure::bluetooth::BleLink;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

/// Inclusive bounds for actuator speed
pub const MIN_SPEED: i32 = -100;
pub const MAX_SPEED: i32 = 100;

/// Longest ramp the hub can express (u16 milliseconds)
pub const MAX_RAMP_MS: i64 = u16::MAX as i64;

type SensorHandler = Box<dyn FnMut(SensorValue) + Send>;

/// State shared between the session and the control handles it gives out.
struct Shared {
    identity: String,
    name: String,
    link: Arc<dyn BleLink>,
    state: Mutex<ConnectionState>,
    retired: AtomicBool,
    last_values: Mutex<HashMap<String, SensorValue>>,
    events: OnceLock<mpsc::UnboundedSender<SessionEvent>>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> ConnectionState {
        *self.lock_state()
    }

    fn transition(&self, to: ConnectionState) -> Result<(), HubError> {
        {
            let mut state = self.lock_state();
            let from = *state;
            if !from.can_transition_to(to) {
                return Err(HubError::InvalidTransition { from, to });
            }
            *state = to;
            debug!("{}: {:?} -> {:?}", self.name, from, to);
        }
        if to == ConnectionState::Disconnected {
            self.retired.store(true, Ordering::SeqCst);
        }
        self.emit(SessionEvent::StateChanged {
            identity: self.identity.clone(),
            state: to,
        });
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), HubError> {
        if self.state() == ConnectionState::Running {
            Ok(())
        } else {
            Err(HubError::SessionClosed(self.identity.clone()))
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(sender) = self.events.get() {
            let _ = sender.send(event);
        }
    }

    fn record_value(&self, capability: &str, value: SensorValue) {
        self.last_values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(capability.to_string(), value);
    }

    fn last_value(&self, capability: &str) -> Option<SensorValue> {
        self.last_values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(capability)
            .cloned()
    }
}

/// A sensor subscription opened while connecting.
struct SensorFeed {
    capability: Arc<dyn Capability>,
    updates: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// How the run loop ended.
enum Outcome {
    Finished(Result<(), HubError>),
    Stopped,
    Dropped,
}

/// One hub connection and the behavior running against it.
pub struct HubSession {
    shared: Arc<Shared>,
    capabilities: Vec<Arc<dyn Capability>>,
    motors: Arc<HashMap<String, MotorHandle>>,
    handlers: HashMap<String, SensorHandler>,
    feeds: Vec<SensorFeed>,
    stop: Arc<Notify>,
}

impl HubSession {
    /// Create a disconnected session for `record`. Descriptors are validated
    /// here and applied on connect.
    pub fn new(
        record: &HubRecord,
        descriptor: &HubDescriptor,
        link: Arc<dyn BleLink>,
    ) -> Result<Self, HubError> {
        let shared = Arc::new(Shared {
            identity: record.identity.clone(),
            name: record.display_name.clone(),
            link,
            state: Mutex::new(ConnectionState::Disconnected),
            retired: AtomicBool::new(false),
            last_values: Mutex::new(HashMap::new()),
            events: OnceLock::new(),
        });

        let mut capabilities: Vec<Arc<dyn Capability>> = Vec::new();
        for entry in &descriptor.capabilities {
            if capabilities.iter().any(|c| c.name() == entry.name) {
                return Err(HubError::InvalidArgument(format!(
                    "capability {} attached twice",
                    entry.name
                )));
            }
            if capabilities.iter().any(|c| c.port() == entry.port) {
                return Err(HubError::InvalidArgument(format!(
                    "port {} already in use on {}",
                    entry.port, record.display_name
                )));
            }
            capabilities.push(capability::attach(entry)?);
        }

        let motors: HashMap<String, MotorHandle> = capabilities
            .iter()
            .filter(|c| c.actuator().is_some())
            .map(|c| {
                (
                    c.name().to_string(),
                    MotorHandle {
                        shared: shared.clone(),
                        capability: c.clone(),
                        target: Arc::new(tokio::sync::Mutex::new(0)),
                    },
                )
            })
            .collect();

        Ok(Self {
            shared,
            capabilities,
            motors: Arc::new(motors),
            handlers: HashMap::new(),
            feeds: Vec::new(),
            stop: Arc::new(Notify::new()),
        })
    }

    /// Publish state changes and sensor values to `sender`.
    pub fn with_events(self, sender: mpsc::UnboundedSender<SessionEvent>) -> Self {
        let _ = self.shared.events.set(sender);
        self
    }

    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Handle the behavior routine (or anyone else) uses to drive the hub.
    pub fn control(&self) -> HubControl {
        HubControl {
            shared: self.shared.clone(),
            motors: self.motors.clone(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: self.stop.clone(),
        }
    }

    /// Register the handler for value updates from sensor `capability`.
    /// Invocations are serialized and follow arrival order.
    pub fn on_sensor_change<F>(&mut self, capability: &str, handler: F) -> Result<(), HubError>
    where
        F: FnMut(SensorValue) + Send + 'static,
    {
        let is_sensor = self
            .capabilities
            .iter()
            .any(|c| c.name() == capability && c.sensor().is_some());
        if !is_sensor {
            return Err(HubError::InvalidArgument(format!(
                "{} has no sensor named {}",
                self.shared.name, capability
            )));
        }
        self.handlers
            .insert(capability.to_string(), Box::new(handler));
        Ok(())
    }

    /// Open the link and apply every capability descriptor. A failure or a
    /// timeout leaves the session `Disconnected` for good.
    pub async fn connect(&mut self, timeout: Duration) -> Result<(), HubError> {
        if self.shared.retired.load(Ordering::SeqCst) {
            return Err(HubError::SessionClosed(self.shared.identity.clone()));
        }
        self.shared.transition(ConnectionState::Connecting)?;
        info!(
            "Connecting to {} ({})",
            self.shared.name, self.shared.identity
        );

        let attempt = Self::establish(&self.shared, &self.capabilities);
        let result = match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(HubError::ConnectionFailed {
                identity: self.shared.identity.clone(),
                reason: format!("timed out after {} ms", timeout.as_millis()),
            }),
        };

        match result {
            Ok(feeds) => {
                self.feeds = feeds;
                self.shared.transition(ConnectionState::Connected)?;
                info!("{} connected", self.shared.name);
                Ok(())
            }
            Err(e) => {
                error!("Connection to {} failed: {}", self.shared.name, e);
                self.shared.transition(ConnectionState::Errored)?;
                self.cleanup().await;
                Err(match e {
                    HubError::ConnectionFailed { .. } => e,
                    other => HubError::ConnectionFailed {
                        identity: self.shared.identity.clone(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    async fn establish(
        shared: &Shared,
        capabilities: &[Arc<dyn Capability>],
    ) -> Result<Vec<SensorFeed>, HubError> {
        shared.link.connect(&shared.identity).await?;

        let mut feeds = Vec::new();
        for capability in capabilities {
            // subscribe before setup so the first reported value is not lost
            if capability.sensor().is_some() {
                let updates = shared.link.subscribe(capability.port()).await?;
                feeds.push(SensorFeed {
                    capability: capability.clone(),
                    updates,
                });
            }
            for frame in capability.setup_frames() {
                shared.link.send(frame).await?;
            }
            debug!(
                "{}: attached {} ({:?}) on port {}",
                shared.name,
                capability.name(),
                capability.kind(),
                capability.port()
            );
        }
        Ok(feeds)
    }

    /// Run `behavior` until it returns, the link drops or a stop is
    /// requested. Consumes the session: one behavior per session.
    pub async fn run<F, Fut>(mut self, behavior: F) -> Result<(), HubError>
    where
        F: FnOnce(HubControl) -> Fut + Send,
        Fut: Future<Output = Result<(), HubError>> + Send,
    {
        if self.shared.state() != ConnectionState::Connected {
            return Err(HubError::SessionClosed(self.shared.identity.clone()));
        }
        self.shared.transition(ConnectionState::Running)?;
        info!("{} is running", self.shared.name);

        let shared = self.shared.clone();
        let stop = self.stop.clone();
        let mut handlers = std::mem::take(&mut self.handlers);

        let has_sensors = !self.feeds.is_empty();
        let mut updates = stream::select_all(self.feeds.drain(..).map(|feed| {
            let SensorFeed {
                capability,
                updates,
            } = feed;
            stream::unfold(updates, |mut rx| async move {
                rx.recv().await.map(|raw| (raw, rx))
            })
            .map(move |raw| (capability.clone(), raw))
            .boxed()
        }))
        .fuse();

        let mut behavior = Box::pin(behavior(self.control()));

        let outcome = loop {
            tokio::select! {
                biased;
                _ = stop.notified() => break Outcome::Stopped,
                _ = shared.link.closed() => break Outcome::Dropped,
                update = updates.next(), if has_sensors => match update {
                    Some((capability, raw)) => {
                        deliver(&shared, &mut handlers, capability.as_ref(), &raw)
                    }
                    None => break Outcome::Dropped,
                },
                result = &mut behavior => break Outcome::Finished(result),
            }
        };

        // cancel the behavior at its current suspension point
        drop(behavior);
        drop(updates);
        drop(handlers);

        match outcome {
            Outcome::Finished(Ok(())) => {
                info!("{} finished", self.shared.name);
                self.shutdown().await
            }
            Outcome::Stopped => {
                info!("{} stopped on request", self.shared.name);
                self.shutdown().await
            }
            Outcome::Finished(Err(e)) => {
                error!("{} behavior failed: {}", self.shared.name, e);
                self.shared.transition(ConnectionState::Errored)?;
                self.cleanup().await;
                Err(e)
            }
            Outcome::Dropped => {
                warn!("{} link dropped", self.shared.name);
                self.shared.transition(ConnectionState::Errored)?;
                self.cleanup().await;
                Err(HubError::LinkDropped(self.shared.identity.clone()))
            }
        }
    }

    /// Close a connected session that never ran a behavior.
    pub async fn disconnect(mut self) -> Result<(), HubError> {
        self.shutdown().await
    }

    async fn shutdown(&mut self) -> Result<(), HubError> {
        self.shared.transition(ConnectionState::Disconnecting)?;
        self.release();
        let result = self.shared.link.disconnect().await;
        self.shared.transition(ConnectionState::Disconnected)?;
        info!("{} disconnected", self.shared.name);
        result
    }

    /// Errored -> Disconnected. Link errors are logged, not raised.
    async fn cleanup(&mut self) {
        self.release();
        if let Err(e) = self.shared.link.disconnect().await {
            warn!("Disconnect of {} after error failed: {}", self.shared.name, e);
        }
        if let Err(e) = self.shared.transition(ConnectionState::Disconnected) {
            warn!("{}", e);
        }
    }

    fn release(&mut self) {
        self.feeds.clear();
        self.handlers.clear();
    }
}

/// Decode one raw update and hand it to the capability's handler.
fn deliver(
    shared: &Shared,
    handlers: &mut HashMap<String, SensorHandler>,
    capability: &dyn Capability,
    raw: &[u8],
) {
    if shared.state() != ConnectionState::Running {
        return;
    }
    let Some(sensor) = capability.sensor() else {
        return;
    };
    match sensor.decode(raw) {
        Ok(value) => {
            debug!("{}: {} -> {:?}", shared.name, capability.name(), value);
            shared.record_value(capability.name(), value.clone());
            shared.emit(SessionEvent::SensorChanged {
                identity: shared.identity.clone(),
                capability: capability.name().to_string(),
                value: value.clone(),
            });
            if let Some(handler) = handlers.get_mut(capability.name()) {
                handler(value);
            }
        }
        Err(e) => warn!(
            "{}: undecodable update from {}: {}",
            shared.name,
            capability.name(),
            e
        ),
    }
}

/// Requests teardown of a running session.
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<Notify>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stop.notify_one();
    }
}

/// What a behavior routine sees of its session.
#[derive(Clone)]
pub struct HubControl {
    shared: Arc<Shared>,
    motors: Arc<HashMap<String, MotorHandle>>,
}

impl HubControl {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn motor(&self, name: &str) -> Result<MotorHandle, HubError> {
        self.motors.get(name).cloned().ok_or_else(|| {
            HubError::InvalidArgument(format!("{} has no motor named {}", self.shared.name, name))
        })
    }

    /// Most recent decoded value from sensor `capability`.
    pub fn last_value(&self, capability: &str) -> Option<SensorValue> {
        self.shared.last_value(capability)
    }
}

/// Typed command channel to one actuator.
#[derive(Clone)]
pub struct MotorHandle {
    shared: Arc<Shared>,
    capability: Arc<dyn Capability>,
    /// Last accepted target; the lock keeps one command in flight.
    target: Arc<tokio::sync::Mutex<i8>>,
}

impl MotorHandle {
    pub fn name(&self) -> &str {
        self.capability.name()
    }

    /// Set the speed immediately. Sign is direction, 0 stops.
    pub async fn set_speed(&self, speed: i32) -> Result<(), HubError> {
        self.shared.ensure_running()?;
        let speed = check_speed(speed)?;

        let mut target = self.target.lock().await;
        self.shared.ensure_running()?;
        let payload = self.actuator()?.set_speed_payload(speed);
        self.shared.link.send(payload).await?;
        *target = speed;
        debug!("{}: {} speed {}", self.shared.name, self.name(), speed);
        Ok(())
    }

    /// Ramp from the current speed to `target` over `duration_ms`. Returns
    /// once the link accepted the command, not when the ramp completes.
    pub async fn ramp_speed(&self, target: i32, duration_ms: i64) -> Result<(), HubError> {
        self.shared.ensure_running()?;
        let speed = check_speed(target)?;
        if !(0..=MAX_RAMP_MS).contains(&duration_ms) {
            return Err(HubError::InvalidArgument(format!(
                "ramp duration {} ms outside 0..={}",
                duration_ms, MAX_RAMP_MS
            )));
        }

        let mut current = self.target.lock().await;
        self.shared.ensure_running()?;
        let payload = self.actuator()?.ramp_payload(speed, duration_ms as u16);
        self.shared.link.send(payload).await?;
        debug!(
            "{}: {} ramp {} -> {} over {} ms",
            self.shared.name,
            self.name(),
            *current,
            speed,
            duration_ms
        );
        *current = speed;
        Ok(())
    }

    fn actuator(&self) -> Result<&dyn capability::Actuator, HubError> {
        self.capability.actuator().ok_or_else(|| {
            HubError::InvalidArgument(format!("{} is not an actuator", self.capability.name()))
        })
    }
}

fn check_speed(speed: i32) -> Result<i8, HubError> {
    if (MIN_SPEED..=MAX_SPEED).contains(&speed) {
        Ok(speed as i8)
    } else {
        Err(HubError::InvalidArgument(format!(
            "speed {} outside {}..={}",
            speed, MIN_SPEED, MAX_SPEED
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{CapabilityDescriptor, Color, SensorMode};
    use crate::infrastructure::bluetooth::protocol::Frame;
    use crate::infrastructure::bluetooth::simulated::SimulatedHub;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn record() -> HubRecord {
        HubRecord::discovered(ADDRESS, "train_1")
    }

    fn motor_only() -> HubDescriptor {
        HubDescriptor::default().with(CapabilityDescriptor::motor("motor", 0))
    }

    fn motor_and_colour() -> HubDescriptor {
        motor_only().with(CapabilityDescriptor::vision_sensor(
            "train_sensor",
            1,
            &[SensorMode::SenseColor],
        ))
    }

    async fn connected(hub: &SimulatedHub, descriptor: &HubDescriptor) -> HubSession {
        let mut session = HubSession::new(&record(), descriptor, Arc::new(hub.clone())).unwrap();
        session.connect(Duration::from_secs(5)).await.unwrap();
        session
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_states() {
        let hub = SimulatedHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = HubSession::new(&record(), &motor_only(), Arc::new(hub.clone()))
            .unwrap()
            .with_events(tx);
        session.connect(Duration::from_secs(5)).await.unwrap();
        session.run(|_| async { Ok(()) }).await.unwrap();

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::StateChanged { state, .. } = event {
                states.push(state);
            }
        }
        use ConnectionState::*;
        assert_eq!(
            states,
            vec![Connecting, Connected, Running, Disconnecting, Disconnected]
        );
        assert!(!hub.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_rejected_outside_running() {
        let hub = SimulatedHub::new();
        let session = HubSession::new(&record(), &motor_only(), Arc::new(hub.clone())).unwrap();
        let motor = session.control().motor("motor").unwrap();

        assert!(matches!(
            motor.set_speed(10).await,
            Err(HubError::SessionClosed(_))
        ));

        let mut session = session;
        session.connect(Duration::from_secs(5)).await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(matches!(
            motor.set_speed(10).await,
            Err(HubError::SessionClosed(_))
        ));
        assert!(matches!(
            motor.ramp_speed(10, 100).await,
            Err(HubError::SessionClosed(_))
        ));

        session.run(|_| async { Ok(()) }).await.unwrap();
        assert!(matches!(
            motor.set_speed(0).await,
            Err(HubError::SessionClosed(_))
        ));
        assert!(hub.sent_commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_argument_validation() {
        let hub = SimulatedHub::new();
        let session = connected(&hub, &motor_only()).await;
        session
            .run(|hub_control| async move {
                let motor = hub_control.motor("motor")?;
                assert!(matches!(
                    motor.set_speed(101).await,
                    Err(HubError::InvalidArgument(_))
                ));
                assert!(matches!(
                    motor.set_speed(-101).await,
                    Err(HubError::InvalidArgument(_))
                ));
                assert!(matches!(
                    motor.ramp_speed(40, -1).await,
                    Err(HubError::InvalidArgument(_))
                ));
                assert!(matches!(
                    motor.ramp_speed(40, MAX_RAMP_MS + 1).await,
                    Err(HubError::InvalidArgument(_))
                ));
                assert!(hub_control.motor("nope").is_err());
                motor.set_speed(-100).await?;
                motor.ramp_speed(100, 0).await
            })
            .await
            .unwrap();
        assert_eq!(hub.sent_commands().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_sequence_is_recorded_in_order() {
        let hub = SimulatedHub::new();
        let session = connected(&hub, &motor_only()).await;
        session
            .run(|hub_control| async move {
                let motor = hub_control.motor("motor")?;
                motor.ramp_speed(40, 2000).await?;
                tokio::time::sleep(Duration::from_secs(2)).await;
                motor.ramp_speed(0, 500).await?;
                tokio::time::sleep(Duration::from_millis(500)).await;
                motor.ramp_speed(-40, 2000).await
            })
            .await
            .unwrap();

        let ramps: Vec<_> = hub
            .sent_commands()
            .into_iter()
            .map(|frames| match frames.as_slice() {
                [Frame::SetAccTime { time_ms, .. }, Frame::StartSpeed { speed, .. }] => {
                    (*speed, *time_ms)
                }
                other => panic!("unexpected command {:?}", other),
            })
            .collect();
        assert_eq!(ramps, vec![(40, 2000), (0, 500), (-40, 2000)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_setup_is_sent_on_connect() {
        let hub = SimulatedHub::new();
        let _session = connected(&hub, &motor_and_colour()).await;
        assert_eq!(
            hub.sent_frames(),
            vec![Frame::InputFormatSetup {
                port: 1,
                mode: 0,
                delta: 1,
                notify: true
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_handler_sees_every_update_in_order() {
        let hub = SimulatedHub::new();
        let mut session = connected(&hub, &motor_and_colour()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .on_sensor_change("train_sensor", move |value| {
                let _ = tx.send(value);
            })
            .unwrap();

        for raw in [6u8, 6, 7, 3] {
            assert!(hub.notify(1, &[raw]));
        }

        session
            .run(|hub_control| async move {
                let mut seen = Vec::new();
                while seen.len() < 4 {
                    match rx.recv().await {
                        Some(SensorValue::Color(c)) => seen.push(c),
                        _ => break,
                    }
                }
                assert_eq!(
                    seen,
                    vec![Color::Green, Color::Green, Color::Yellow, Color::Blue]
                );
                assert_eq!(
                    hub_control.last_value("train_sensor"),
                    Some(SensorValue::Color(Color::Blue))
                );
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_requires_sensor() {
        let hub = SimulatedHub::new();
        let mut session =
            HubSession::new(&record(), &motor_and_colour(), Arc::new(hub.clone())).unwrap();
        assert!(session.on_sensor_change("motor", |_| {}).is_err());
        assert!(session.on_sensor_change("train_sensor", |_| {}).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_terminal() {
        let hub = SimulatedHub::unreachable("adapter busy");
        let mut session =
            HubSession::new(&record(), &motor_only(), Arc::new(hub.clone())).unwrap();

        let err = session.connect(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, HubError::ConnectionFailed { .. }));
        assert_eq!(session.state(), ConnectionState::Disconnected);

        assert!(matches!(
            session.connect(Duration::from_secs(5)).await,
            Err(HubError::SessionClosed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let hub = SimulatedHub::new().with_connect_delay(Duration::from_secs(30));
        let mut session =
            HubSession::new(&record(), &motor_only(), Arc::new(hub.clone())).unwrap();

        let err = session.connect(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            HubError::ConnectionFailed { ref reason, .. } if reason.contains("timed out")
        ));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        // the abandoned attempt is still torn down
        assert_eq!(hub.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_link_is_released() {
        let hub = SimulatedHub::rejecting_writes("GATT write refused");
        let mut session =
            HubSession::new(&record(), &motor_and_colour(), Arc::new(hub.clone())).unwrap();

        let err = session.connect(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(
            err,
            HubError::ConnectionFailed { ref reason, .. } if reason.contains("refused")
        ));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(hub.disconnects(), 1);
        assert!(!hub.is_connected());
        assert!(!hub.notify(1, &[3]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_drop_cancels_behavior() {
        let hub = SimulatedHub::new();
        let mut session = connected(&hub, &motor_and_colour()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .on_sensor_change("train_sensor", move |value| {
                let _ = tx.send(value);
            })
            .unwrap();
        let control = session.control();

        let dropper = hub.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            dropper.drop_link();
        });

        let result = session
            .run(|hub_control| async move {
                hub_control.motor("motor")?.set_speed(20).await?;
                tokio::time::sleep(Duration::from_secs(60)).await;
                hub_control.motor("motor")?.set_speed(0).await
            })
            .await;

        assert!(matches!(result, Err(HubError::LinkDropped(_))));
        assert_eq!(control.state(), ConnectionState::Disconnected);
        assert_eq!(hub.sent_commands().len(), 2); // sensor setup + set_speed(20)

        // nothing is delivered once the session has errored
        assert!(!hub.notify(1, &[3]));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_handle_tears_down() {
        let hub = SimulatedHub::new();
        let session = connected(&hub, &motor_only()).await;
        let stop = session.stop_handle();
        let control = session.control();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            stop.stop();
        });

        session
            .run(|hub_control| async move {
                let motor = hub_control.motor("motor")?;
                loop {
                    motor.set_speed(10).await?;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            })
            .await
            .unwrap();

        assert_eq!(control.state(), ConnectionState::Disconnected);
        assert_eq!(hub.sent_commands().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_behavior_error_goes_through_errored() {
        let hub = SimulatedHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = HubSession::new(&record(), &motor_only(), Arc::new(hub.clone()))
            .unwrap()
            .with_events(tx);
        session.connect(Duration::from_secs(5)).await.unwrap();

        let result = session
            .run(|_| async { Err(HubError::InvalidArgument("boom".to_string())) })
            .await;
        assert!(matches!(result, Err(HubError::InvalidArgument(_))));

        let mut states = Vec::new();
        while let Ok(SessionEvent::StateChanged { state, .. }) = rx.try_recv() {
            states.push(state);
        }
        assert_eq!(
            &states[states.len() - 2..],
            &[ConnectionState::Errored, ConnectionState::Disconnected]
        );
    }

    #[test]
    fn test_descriptor_conflicts() {
        let hub = SimulatedHub::new();
        let clash = motor_only().with(CapabilityDescriptor::motor("motor", 2));
        assert!(HubSession::new(&record(), &clash, Arc::new(hub.clone())).is_err());
        let same_port = motor_only().with(CapabilityDescriptor::motor("second", 0));
        assert!(HubSession::new(&record(), &same_port, Arc::new(hub)).is_err());
    }
}
