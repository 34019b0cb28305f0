//! Discovery and run entry points.
//!
//! The orchestrator owns the registry for the length of a command. Discovery
//! merges newly seen hubs into it; a run confirms names, stamps every hub
//! and then starts one session task per hub.

use crate::domain::models::{DiscoveredHub, HubRecord, SessionEvent};
use crate::domain::registry::{default_hub_name, DeviceRegistry};
use crate::domain::settings::Settings;
use crate::error::HubError;
use crate::infrastructure::bluetooth::{
    BleLink, BleScan, DiscoveryScanner, HubSession, LinkFactory, StopHandle,
};
use crate::lessons::Lesson;
use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Asks the user what to call a newly discovered hub.
#[async_trait]
pub trait NamePrompt: Send {
    async fn prompt(&mut self, default_name: &str) -> std::io::Result<String>;
}

/// Interactive prompt on stdin/stdout. A blank answer keeps the default.
pub struct StdinPrompt {
    input: BufReader<Stdin>,
}

impl Default for StdinPrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl StdinPrompt {
    pub fn new() -> Self {
        Self {
            input: BufReader::new(tokio::io::stdin()),
        }
    }
}

#[async_trait]
impl NamePrompt for StdinPrompt {
    async fn prompt(&mut self, default_name: &str) -> std::io::Result<String> {
        let question = format!("Enter a name for the new hub (default: {}): ", default_name);
        let mut stdout = tokio::io::stdout();
        stdout.write_all(question.as_bytes()).await?;
        stdout.flush().await?;

        let mut answer = String::new();
        self.input.read_line(&mut answer).await?;
        let answer = answer.trim();
        Ok(if answer.is_empty() {
            default_name.to_string()
        } else {
            answer.to_string()
        })
    }
}

/// Non-interactive prompt that accepts every default name.
pub struct KeepDefaultNames;

#[async_trait]
impl NamePrompt for KeepDefaultNames {
    async fn prompt(&mut self, default_name: &str) -> std::io::Result<String> {
        Ok(default_name.to_string())
    }
}

#[derive(Debug)]
pub struct DiscoveryReport {
    pub found: Vec<DiscoveredHub>,
    /// Identities that were not in the registry before this scan
    pub added: Vec<String>,
    pub registry_size: usize,
    /// Storage problem that made discovery start from an empty registry
    pub recovered: Option<HubError>,
}

#[derive(Debug)]
pub struct HubOutcome {
    pub identity: String,
    pub name: String,
    pub result: Result<(), HubError>,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<HubOutcome>,
}

impl RunReport {
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_err()).count()
    }
}

#[derive(Default)]
struct StopState {
    stopping: bool,
    handles: Vec<StopHandle>,
}

/// Stops every session started by an orchestrator.
#[derive(Clone, Default)]
pub struct Stopper {
    state: Arc<Mutex<StopState>>,
}

impl Stopper {
    fn lock(&self) -> MutexGuard<'_, StopState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stop_all(&self) {
        let mut state = self.lock();
        state.stopping = true;
        info!("Stopping {} hub sessions", state.handles.len());
        for handle in &state.handles {
            handle.stop();
        }
    }

    /// Track `handle` for `stop_all`. Returns false once a stop has been
    /// requested; the caller must not start its behavior then.
    fn register(&self, handle: StopHandle) -> bool {
        let mut state = self.lock();
        if state.stopping {
            return false;
        }
        state.handles.push(handle);
        true
    }
}

pub struct Orchestrator {
    settings: Settings,
    scanner: DiscoveryScanner,
    links: Arc<dyn LinkFactory>,
    stopper: Stopper,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl Orchestrator {
    pub fn new(settings: Settings, scan: Arc<dyn BleScan>, links: Arc<dyn LinkFactory>) -> Self {
        let scanner = DiscoveryScanner::new(scan, settings.hub_name_signature.clone());
        Self {
            settings,
            scanner,
            links,
            stopper: Stopper::default(),
            events: None,
        }
    }

    /// Forward state changes and sensor values of every session to `sender`.
    pub fn with_events(mut self, sender: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn stopper(&self) -> Stopper {
        self.stopper.clone()
    }

    /// Scan for hubs and add unseen ones to the registry. Registry storage
    /// problems start from an empty registry instead of failing.
    pub async fn discover(&self) -> Result<DiscoveryReport, HubError> {
        let load = DeviceRegistry::load(&self.settings.registry_path);
        let mut registry = load.registry;
        info!("{} hubs currently in mapping file", registry.len());

        let found = self.scanner.scan(self.settings.scan_timeout()).await?;
        let added: Vec<String> = found
            .iter()
            .filter(|hub| registry.upsert_discovered(&hub.identity, default_hub_name))
            .map(|hub| hub.identity.clone())
            .collect();

        registry.save()?;
        info!(
            "{} new hubs added, {} in mapping file",
            added.len(),
            registry.len()
        );

        Ok(DiscoveryReport {
            found,
            added,
            registry_size: registry.len(),
            recovered: load.recovered,
        })
    }

    /// Load the registry for a run, confirm names of new hubs and stamp
    /// `last_initiated`. Any registry problem is fatal here.
    pub async fn prepare_run(
        &self,
        prompt: &mut dyn NamePrompt,
        now: NaiveDateTime,
    ) -> Result<Vec<HubRecord>, HubError> {
        let path = &self.settings.registry_path;
        let mut registry = match DeviceRegistry::load_strict(path) {
            Ok(registry) => registry,
            Err(e) => {
                match &e {
                    HubError::RegistryMissing(_) => {
                        error!("Mapping file not found. Please run discovery first.")
                    }
                    other => error!("Cannot use mapping file: {}", other),
                }
                return Err(e);
            }
        };
        if registry.is_empty() {
            error!("No hubs found in the mapping file.");
            return Err(HubError::RegistryEmpty(path.clone()));
        }

        let new_hubs: Vec<(String, String)> = registry
            .records()
            .iter()
            .filter(|r| r.first_seen)
            .map(|r| (r.identity.clone(), r.display_name.clone()))
            .collect();
        for (identity, default_name) in new_hubs {
            let chosen = prompt.prompt(&default_name).await?;
            registry.confirm_name(&identity, &chosen)?;
            info!("Hub {} named {}", identity, chosen);
        }

        let identities: Vec<String> = registry
            .records()
            .iter()
            .map(|r| r.identity.clone())
            .collect();
        for identity in &identities {
            registry.touch_initiated(identity, now)?;
        }
        registry.save()?;

        Ok(registry.records().to_vec())
    }

    /// Run `lesson` on every registered hub at once. One hub failing does
    /// not stop the others; per-hub results are in the report.
    pub async fn run(
        &self,
        lesson: Lesson,
        prompt: &mut dyn NamePrompt,
    ) -> Result<RunReport, HubError> {
        if self.settings.scan_before_run {
            if let Err(e) = self.discover().await {
                warn!("Hub scan before run failed: {}", e);
            }
        }

        let records = self
            .prepare_run(prompt, Local::now().naive_local())
            .await?;

        let handles: Vec<_> = records
            .into_iter()
            .map(|record| {
                info!(
                    "Initiating hub name: {}, ble id: {}",
                    record.display_name, record.identity
                );
                let link = self.links.create_link();
                let stopper = self.stopper.clone();
                let events = self.events.clone();
                let timeout = self.settings.connect_timeout();
                let identity = record.identity.clone();
                let name = record.display_name.clone();
                let task = tokio::spawn(async move {
                    start_hub(record, lesson, link, timeout, stopper, events).await
                });
                (identity, name, task)
            })
            .collect();

        let mut report = RunReport::default();
        for (identity, name, task) in handles {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(HubError::Protocol(format!("session task failed: {}", e))),
            };
            match &result {
                Ok(()) => info!("{} done", name),
                Err(e) => error!("{} ({}) failed: {}", name, identity, e),
            }
            report.outcomes.push(HubOutcome {
                identity,
                name,
                result,
            });
        }
        Ok(report)
    }
}

async fn start_hub(
    record: HubRecord,
    lesson: Lesson,
    link: Arc<dyn BleLink>,
    timeout: Duration,
    stopper: Stopper,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
) -> Result<(), HubError> {
    let mut session = HubSession::new(&record, &lesson.descriptor(), link)?;
    if let Some(events) = events {
        session = session.with_events(events);
    }
    session.connect(timeout).await?;
    if !stopper.register(session.stop_handle()) {
        info!(
            "Stop requested before {} ({}) started",
            session.name(),
            session.identity()
        );
        return session.disconnect().await;
    }
    lesson.run(session).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ConnectionState;
    use crate::infrastructure::bluetooth::simulated::{SimulatedFleet, SimulatedHub};
    use chrono::NaiveDate;
    use std::collections::VecDeque;
    use std::fs;
    use std::path::Path;

    const HUB_A: &str = "AA:BB:CC:DD:EE:FF";
    const HUB_B: &str = "11:22:33:44:55:66";

    struct Answers(VecDeque<&'static str>);

    #[async_trait]
    impl NamePrompt for Answers {
        async fn prompt(&mut self, default_name: &str) -> std::io::Result<String> {
            Ok(match self.0.pop_front() {
                Some("") | None => default_name.to_string(),
                Some(answer) => answer.to_string(),
            })
        }
    }

    fn settings(dir: &Path) -> Settings {
        Settings {
            registry_path: dir.join("hubs").join("hub_mapping.json"),
            scan_before_run: false,
            ..Settings::default()
        }
    }

    fn orchestrator(settings: Settings, fleet: &SimulatedFleet) -> Orchestrator {
        Orchestrator::new(settings, Arc::new(fleet.clone()), Arc::new(fleet.clone()))
    }

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn one_hub_fleet(hub: SimulatedHub) -> SimulatedFleet {
        SimulatedFleet::new().with_device(Some("Smart Hub"), HUB_A, hub)
    }

    fn saved_json(path: &Path) -> serde_json::Value {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_into_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let path = settings.registry_path.clone();
        let fleet = SimulatedFleet::new()
            .with_device(Some("Smart Hub XYZ"), HUB_A, SimulatedHub::new())
            .with_device(Some("Headphones"), "00:00:00:00:00:09", SimulatedHub::new());

        let report = orchestrator(settings, &fleet).discover().await.unwrap();
        assert_eq!(report.added, vec![HUB_A.to_string()]);
        assert_eq!(
            saved_json(&path),
            serde_json::json!([
                {"ble_id": HUB_A, "hub_name": "train_1", "new": true}
            ])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_keeps_existing_names() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        fs::create_dir_all(settings.registry_path.parent().unwrap()).unwrap();
        fs::write(
            &settings.registry_path,
            format!(r#"[{{"hub_name": "Crocodile", "ble_id": "{}", "new": false}}]"#, HUB_A),
        )
        .unwrap();
        let fleet = SimulatedFleet::new()
            .with_device(Some("Smart Hub"), HUB_A, SimulatedHub::new())
            .with_device(Some("Smart Hub"), HUB_B, SimulatedHub::new());
        let path = settings.registry_path.clone();

        let report = orchestrator(settings, &fleet).discover().await.unwrap();
        assert_eq!(report.added, vec![HUB_B.to_string()]);
        assert_eq!(report.registry_size, 2);

        let registry = DeviceRegistry::load_strict(&path).unwrap();
        assert_eq!(registry.get(HUB_A).unwrap().display_name, "Crocodile");
        assert!(!registry.get(HUB_A).unwrap().first_seen);
        assert_eq!(registry.get(HUB_B).unwrap().display_name, "train_2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_recovers_from_corrupt_registry() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        fs::create_dir_all(settings.registry_path.parent().unwrap()).unwrap();
        fs::write(&settings.registry_path, "").unwrap();
        let fleet = one_hub_fleet(SimulatedHub::new());
        let path = settings.registry_path.clone();

        let report = orchestrator(settings, &fleet).discover().await.unwrap();
        assert!(matches!(
            report.recovered,
            Some(HubError::RegistryCorrupt { .. })
        ));
        assert_eq!(DeviceRegistry::load_strict(&path).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_without_registry() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = SimulatedFleet::new();
        let orchestrator = orchestrator(settings(dir.path()), &fleet);
        assert!(matches!(
            orchestrator.prepare_run(&mut KeepDefaultNames, noon()).await,
            Err(HubError::RegistryMissing(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_empty_registry_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        fs::create_dir_all(settings.registry_path.parent().unwrap()).unwrap();
        fs::write(&settings.registry_path, "[]").unwrap();
        let hub = SimulatedHub::new();
        let fleet = SimulatedFleet::new().with_device(Some("Smart Hub"), HUB_A, hub.clone());

        let result = orchestrator(settings, &fleet)
            .run(Lesson::ForwardBack, &mut KeepDefaultNames)
            .await;
        assert!(matches!(result, Err(HubError::RegistryEmpty(_))));
        assert!(hub.sent().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_run_names_and_stamps() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let path = settings.registry_path.clone();
        let mut registry = DeviceRegistry::empty(&path);
        registry.upsert_discovered(HUB_A, default_hub_name);
        registry.upsert_discovered(HUB_B, default_hub_name);
        registry.save().unwrap();

        let orchestrator = orchestrator(settings, &SimulatedFleet::new());
        let records = orchestrator
            .prepare_run(&mut Answers(VecDeque::from(["Crocodile", ""])), noon())
            .await
            .unwrap();

        assert_eq!(records[0].display_name, "Crocodile");
        assert_eq!(records[1].display_name, "train_2");
        assert!(records.iter().all(|r| !r.first_seen));
        assert!(records.iter().all(|r| r.last_initiated == Some(noon())));
        assert_eq!(DeviceRegistry::load_strict(&path).unwrap().records(), &records[..]);

        // confirmed names are not asked for again
        let mut never = Answers(VecDeque::from(["should not be used"]));
        let again = orchestrator.prepare_run(&mut never, noon()).await.unwrap();
        assert_eq!(again[0].display_name, "Crocodile");
        assert_eq!(never.0.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failing_hub_does_not_stop_others() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let mut registry = DeviceRegistry::empty(&settings.registry_path);
        registry.upsert_discovered(HUB_A, default_hub_name);
        registry.upsert_discovered(HUB_B, default_hub_name);
        registry.save().unwrap();

        let good = SimulatedHub::new();
        let fleet = SimulatedFleet::new()
            .with_device(Some("Smart Hub"), HUB_A, good.clone())
            .with_device(
                Some("Smart Hub"),
                HUB_B,
                SimulatedHub::unreachable("out of range"),
            );

        let report = orchestrator(settings, &fleet)
            .run(Lesson::ForwardBack, &mut KeepDefaultNames)
            .await
            .unwrap();

        assert_eq!(report.outcomes.len(), 2);
        assert!(report.outcomes[0].result.is_ok());
        assert!(matches!(
            report.outcomes[1].result,
            Err(HubError::ConnectionFailed { .. })
        ));
        assert_eq!(report.failures(), 1);
        assert_eq!(good.sent_commands().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_scans_first() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            scan_before_run: true,
            ..settings(dir.path())
        };
        let path = settings.registry_path.clone();
        let hub = SimulatedHub::new();
        let fleet = SimulatedFleet::new().with_device(Some("Smart Hub"), HUB_A, hub.clone());

        let report = orchestrator(settings, &fleet)
            .run(
                Lesson::ForwardBack,
                &mut Answers(VecDeque::from(["Flying Scotsman"])),
            )
            .await
            .unwrap();

        assert_eq!(report.outcomes[0].name, "Flying Scotsman");
        assert_eq!(report.failures(), 0);
        let saved = saved_json(&path);
        assert_eq!(saved[0]["hub_name"], "Flying Scotsman");
        assert_eq!(saved[0]["new"], false);
        assert!(saved[0]["last_initiated"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_events_are_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let mut registry = DeviceRegistry::empty(&settings.registry_path);
        registry.upsert_discovered(HUB_A, default_hub_name);
        registry.save().unwrap();

        let fleet = one_hub_fleet(SimulatedHub::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        orchestrator(settings, &fleet)
            .with_events(tx)
            .run(Lesson::ForwardBack, &mut KeepDefaultNames)
            .await
            .unwrap();

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::StateChanged { identity, state } = event {
                assert_eq!(identity, HUB_A);
                states.push(state);
            }
        }
        assert_eq!(states.first(), Some(&ConnectionState::Connecting));
        assert_eq!(states.last(), Some(&ConnectionState::Disconnected));
        assert!(states.contains(&ConnectionState::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let mut registry = DeviceRegistry::empty(&settings.registry_path);
        registry.upsert_discovered(HUB_A, default_hub_name);
        registry.save().unwrap();

        // colour lesson never ends without a blue reading
        let fleet = one_hub_fleet(SimulatedHub::new());
        let orchestrator = orchestrator(settings, &fleet);
        let stopper = orchestrator.stopper();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            stopper.stop_all();
        });

        let report = orchestrator
            .run(Lesson::ColourStop, &mut KeepDefaultNames)
            .await
            .unwrap();
        assert_eq!(report.failures(), 0);
    }

    #[test]
    fn test_register_after_stop_all_is_refused() {
        let stopper = Stopper::default();
        let session = HubSession::new(
            &HubRecord::discovered(HUB_A, "train_1"),
            &Lesson::ForwardBack.descriptor(),
            Arc::new(SimulatedHub::new()),
        )
        .unwrap();

        assert!(stopper.register(session.stop_handle()));
        stopper.stop_all();
        assert!(!stopper.register(session.stop_handle()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_start_disconnects_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let mut registry = DeviceRegistry::empty(&settings.registry_path);
        registry.upsert_discovered(HUB_A, default_hub_name);
        registry.save().unwrap();

        let hub = SimulatedHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let orchestrator = orchestrator(settings, &one_hub_fleet(hub.clone())).with_events(tx);
        orchestrator.stopper().stop_all();

        let report = orchestrator
            .run(Lesson::ForwardBack, &mut KeepDefaultNames)
            .await
            .unwrap();
        assert_eq!(report.failures(), 0);
        assert!(hub.sent().is_empty());
        assert!(!hub.is_connected());

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::StateChanged { state, .. } = event {
                states.push(state);
            }
        }
        use ConnectionState::*;
        assert_eq!(states, vec![Connecting, Connected, Disconnecting, Disconnected]);
    }
}
