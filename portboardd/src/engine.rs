use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use shared::types::{EnrichedService, HostSnapshot, Observation, OverlayFields, PortObservation, Snapshot};
use crate::enrich::Enricher;
use crate::overlay::OverlayHandle;
use crate::scan::{ScanError, ScanMode, Scanner};
use crate::snapshot::SnapshotCache;

/// Where the engine is within a discovery cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleState {
    Idle,
    Scanning,
    Enriching,
    Merging,
    Published,
}

/// Returns the engine to `Idle` however the cycle ends, including when the
/// cycle future is dropped.
struct IdleOnDrop<'a>(&'a watch::Sender<CycleState>);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.send_replace(CycleState::Idle);
    }
}

/// Runs discovery cycles: scan, enrich, record bookkeeping, publish.
pub struct Engine {
    range: String,
    scanner: Arc<dyn Scanner>,
    enricher: Arc<dyn Enricher>,
    overlay: OverlayHandle,
    cache: SnapshotCache,
    concurrency: usize,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    state_tx: watch::Sender<CycleState>,
}

fn is_ssh_like(hint: &str) -> bool {
    hint.to_ascii_lowercase().starts_with("ssh")
}

/// Numeric address order where possible, textual otherwise
fn sort_hosts(hosts: &mut Vec<Observation>) {
    hosts.sort_by_cached_key(|h| {
        let ip = h.address.parse::<IpAddr>().ok();
        (ip.is_none(), ip, h.address.clone())
    });
    hosts.dedup_by(|a, b| a.address == b.address);
}

fn sort_ports(ports: &mut Vec<PortObservation>) {
    ports.sort_by_key(|p| (p.port, p.protocol));
    ports.dedup_by_key(|p| (p.port, p.protocol));
}

impl Engine {
    /// The cached snapshot, if any, is published immediately.
    pub fn new(
        range: impl Into<String>,
        scanner: Arc<dyn Scanner>,
        enricher: Arc<dyn Enricher>,
        overlay: OverlayHandle,
        cache: SnapshotCache,
        concurrency: usize,
    ) -> Self {
        let cached = cache.load();
        tracing::info!("Loaded cached snapshot with {} hosts", cached.hosts.len());
        let (snapshot_tx, _) = watch::channel(Arc::new(cached));
        let (state_tx, _) = watch::channel(CycleState::Idle);

        Self {
            range: range.into(),
            scanner,
            enricher,
            overlay,
            cache,
            concurrency: concurrency.max(1),
            snapshot_tx,
            state_tx,
        }
    }

    pub fn snapshots(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub fn states(&self) -> watch::Receiver<CycleState> {
        self.state_tx.subscribe()
    }

    fn enter(&self, state: CycleState) {
        tracing::debug!("Cycle state: {:?}", state);
        self.state_tx.send_replace(state);
    }

    /// Run one discovery cycle. A failed range scan leaves the previously
    /// published snapshot in place; per-service problems never fail the cycle.
    pub async fn run_cycle(&self) -> Result<Arc<Snapshot>, ScanError> {
        let started = Instant::now();
        let _idle = IdleOnDrop(&self.state_tx);

        self.enter(CycleState::Scanning);
        let mut observations = self.scanner.scan(&self.range, ScanMode::Fast).await?;
        sort_hosts(&mut observations);
        tracing::info!("Found {} hosts in {}", observations.len(), self.range);

        self.enter(CycleState::Enriching);
        let mut hosts = Vec::with_capacity(observations.len());
        for observation in observations {
            hosts.push(self.process_host(observation).await);
        }

        self.enter(CycleState::Merging);
        let snapshot = Snapshot {
            scanned_at: Some(Utc::now()),
            hosts,
        };
        if let Err(e) = self.overlay.persist().await {
            tracing::warn!("Failed to persist overlay after cycle: {}", e);
        }
        if let Err(e) = self.cache.save(&snapshot).await {
            tracing::warn!("Failed to save snapshot cache: {:#}", e);
        }

        let snapshot = Arc::new(snapshot);
        self.snapshot_tx.send_replace(snapshot.clone());
        self.enter(CycleState::Published);

        tracing::info!(
            "Cycle finished: {} hosts, {} services in {:?}",
            snapshot.hosts.len(),
            snapshot.hosts.iter().map(|h| h.services.len()).sum::<usize>(),
            started.elapsed()
        );
        Ok(snapshot)
    }

    async fn process_host(&self, observation: Observation) -> HostSnapshot {
        let Observation { address, mut hostname, mut ports } = observation;

        let stored = match self.overlay.observe_host(address.clone(), Utc::now()).await {
            Ok(host) => Some(host),
            Err(e) => {
                tracing::warn!(address = %address, "Failed to record host: {}", e);
                None
            }
        };
        let favorite = stored
            .as_ref()
            .and_then(|h| h.favorite())
            .unwrap_or_else(|| ports.iter().any(|p| is_ssh_like(&p.service_hint)));

        if favorite {
            match self.scanner.scan(&address, ScanMode::Full).await {
                Ok(found) => {
                    if let Some(full) = found.into_iter().next() {
                        hostname = hostname.or(full.hostname);
                        ports = full.ports;
                    }
                }
                Err(e) => {
                    tracing::warn!(address = %address, "Full scan failed, keeping sweep results: {}", e);
                }
            }
        }
        sort_ports(&mut ports);

        let services: Vec<EnrichedService> = stream::iter(ports)
            .map(|port| {
                let enricher = self.enricher.clone();
                let address = address.clone();
                async move { enricher.enrich(&address, &port).await }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        for service in &services {
            if let Err(e) = self
                .overlay
                .observe_service(address.clone(), service.port(), Utc::now())
                .await
            {
                tracing::warn!(address = %address, port = service.port(), "Failed to record service: {}", e);
            }
        }

        HostSnapshot {
            address,
            hostname,
            favorite,
            services,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use async_trait::async_trait;
    use shared::types::OverlayValue;
    use crate::enrich::tests::{broken_icon_ui, device_ui, enricher, serve, tcp};
    use crate::icons::IconStore;
    use crate::overlay::OverlayStore;

    /// Canned scan results keyed by target
    #[derive(Default)]
    pub struct FakeScanner {
        pub results: Mutex<HashMap<String, Result<Vec<Observation>, String>>>,
        pub calls: Mutex<Vec<(String, ScanMode)>>,
    }

    impl FakeScanner {
        pub fn answer(&self, target: &str, result: Result<Vec<Observation>, String>) {
            self.results.lock().unwrap().insert(target.to_string(), result);
        }

        fn calls(&self) -> Vec<(String, ScanMode)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Scanner for FakeScanner {
        async fn scan(&self, target: &str, mode: ScanMode) -> Result<Vec<Observation>, ScanError> {
            self.calls.lock().unwrap().push((target.to_string(), mode));
            match self.results.lock().unwrap().get(target) {
                Some(Ok(hosts)) => Ok(hosts.clone()),
                Some(Err(stderr)) => Err(ScanError::Exit {
                    status: "exit status: 1".to_string(),
                    stderr: stderr.clone(),
                }),
                None => Ok(Vec::new()),
            }
        }
    }

    /// Names every service "<hint> service"
    pub struct FakeEnricher;

    #[async_trait]
    impl Enricher for FakeEnricher {
        async fn enrich(&self, _address: &str, observed: &PortObservation) -> EnrichedService {
            EnrichedService {
                observed: observed.clone(),
                display_name: format!("{} service", observed.service_hint),
                icon: None,
            }
        }
    }

    pub fn host(address: &str, ports: &[(u16, &str)]) -> Observation {
        Observation {
            address: address.to_string(),
            hostname: None,
            ports: ports.iter().map(|(port, hint)| tcp(*port, hint)).collect(),
        }
    }

    pub struct Harness {
        pub dir: tempfile::TempDir,
        pub scanner: Arc<FakeScanner>,
        pub overlay: OverlayHandle,
        pub engine: Engine,
    }

    pub fn harness_with(enricher: Arc<dyn Enricher>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let scanner = Arc::new(FakeScanner::default());
        let overlay = OverlayHandle::spawn(OverlayStore::open(dir.path().join("config.json")).unwrap());
        let engine = Engine::new(
            "10.0.0.0/24",
            scanner.clone(),
            enricher,
            overlay.clone(),
            SnapshotCache::new(dir.path().join("cache.json")),
            4,
        );
        Harness { dir, scanner, overlay, engine }
    }

    pub fn harness() -> Harness {
        harness_with(Arc::new(FakeEnricher))
    }

    #[tokio::test]
    async fn test_cycle_publishes_ordered_snapshot() {
        let h = harness();
        h.scanner.answer(
            "10.0.0.0/24",
            Ok(vec![
                host("10.0.0.10", &[(443, "https"), (80, "http")]),
                host("10.0.0.9", &[]),
            ]),
        );

        let snapshot = h.engine.run_cycle().await.unwrap();

        let addresses: Vec<&str> = snapshot.hosts.iter().map(|h| h.address.as_str()).collect();
        assert_eq!(addresses, vec!["10.0.0.9", "10.0.0.10"]);
        let ports: Vec<u16> = snapshot.hosts[1].services.iter().map(|s| s.port()).collect();
        assert_eq!(ports, vec![80, 443]);
        assert_eq!(snapshot.hosts[1].services[0].display_name, "http service");

        assert_eq!(*h.engine.snapshots().borrow(), snapshot);
        assert_eq!(*h.engine.states().borrow(), CycleState::Idle);

        let cached = SnapshotCache::new(h.dir.path().join("cache.json")).load();
        assert_eq!(cached, *snapshot);
        let persisted = OverlayStore::load(&h.dir.path().join("config.json")).unwrap();
        assert_eq!(persisted.hosts.len(), 2);
    }

    #[tokio::test]
    async fn test_first_seen_stable_across_cycles() {
        let h = harness();
        h.scanner.answer("10.0.0.0/24", Ok(vec![host("10.0.0.5", &[(80, "http")])]));

        h.engine.run_cycle().await.unwrap();
        let first = h.overlay.current().host("10.0.0.5").unwrap().clone();

        for _ in 0..3 {
            h.engine.run_cycle().await.unwrap();
        }
        let later = h.overlay.current().host("10.0.0.5").unwrap().clone();

        assert_eq!(later.first_seen, first.first_seen);
        assert!(later.last_seen >= first.last_seen);
        assert_eq!(later.service(80).unwrap().first_seen, first.service(80).unwrap().first_seen);
        assert!(later.service(80).unwrap().last_seen >= first.service(80).unwrap().last_seen);
        assert_eq!(later.services.len(), 1);
    }

    #[tokio::test]
    async fn test_user_overrides_survive_cycle() {
        let h = harness();
        h.overlay
            .set_field("10.0.0.5".into(), Some(631), "name".into(), OverlayValue::from_text("My Printer"))
            .await
            .unwrap();
        h.overlay
            .set_field("10.0.0.5".into(), Some(9100), "hidden".into(), OverlayValue::from_text("true"))
            .await
            .unwrap();
        h.scanner.answer("10.0.0.0/24", Ok(vec![host("10.0.0.5", &[(631, "ipp")])]));

        let snapshot = h.engine.run_cycle().await.unwrap();

        let stored = h.overlay.current().host("10.0.0.5").unwrap().clone();
        assert_eq!(stored.service(631).unwrap().name(), Some("My Printer"));
        assert!(stored.service(631).unwrap().first_seen.is_some());
        // not observed this cycle, still kept
        assert_eq!(stored.service(9100).unwrap().hidden(), Some(true));
        assert_eq!(snapshot.hosts[0].services[0].display_name, "ipp service");
    }

    #[tokio::test]
    async fn test_scan_failure_keeps_previous_snapshot() {
        let h = harness();
        h.scanner.answer("10.0.0.0/24", Ok(vec![host("10.0.0.5", &[(80, "http")])]));
        let good = h.engine.run_cycle().await.unwrap();

        h.scanner.answer("10.0.0.0/24", Err("requires root".to_string()));
        assert!(matches!(h.engine.run_cycle().await, Err(ScanError::Exit { .. })));

        assert_eq!(*h.engine.snapshots().borrow(), good);
        assert_eq!(*h.engine.states().borrow(), CycleState::Idle);
    }

    #[tokio::test]
    async fn test_ssh_hosts_get_full_scan() {
        let h = harness();
        h.scanner.answer(
            "10.0.0.0/24",
            Ok(vec![host("10.0.0.2", &[(22, "ssh")]), host("10.0.0.3", &[(80, "http")])]),
        );
        h.scanner.answer(
            "10.0.0.2",
            Ok(vec![host("10.0.0.2", &[(22, "ssh"), (8123, "unknown"), (3000, "ppp")])]),
        );

        let snapshot = h.engine.run_cycle().await.unwrap();

        assert!(snapshot.hosts[0].favorite);
        let ports: Vec<u16> = snapshot.hosts[0].services.iter().map(|s| s.port()).collect();
        assert_eq!(ports, vec![22, 3000, 8123]);
        assert!(!snapshot.hosts[1].favorite);
        assert_eq!(
            h.scanner.calls(),
            vec![
                ("10.0.0.0/24".to_string(), ScanMode::Fast),
                ("10.0.0.2".to_string(), ScanMode::Full),
            ]
        );
    }

    #[tokio::test]
    async fn test_stored_favorite_overrides_ssh_default() {
        let h = harness();
        h.overlay
            .set_field("10.0.0.2".into(), None, "favorite".into(), OverlayValue::from_text("false"))
            .await
            .unwrap();
        h.overlay
            .set_field("10.0.0.3".into(), None, "favorite".into(), OverlayValue::from_text("true"))
            .await
            .unwrap();
        h.scanner.answer(
            "10.0.0.0/24",
            Ok(vec![host("10.0.0.2", &[(22, "ssh")]), host("10.0.0.3", &[(80, "http")])]),
        );
        h.scanner.answer("10.0.0.3", Err("host went away".to_string()));

        let snapshot = h.engine.run_cycle().await.unwrap();

        assert!(!snapshot.hosts[0].favorite);
        assert!(snapshot.hosts[1].favorite);
        // failed full scan keeps the sweep's ports
        assert_eq!(snapshot.hosts[1].services[0].port(), 80);
        assert_eq!(h.scanner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_enrichment_failure_does_not_spread() {
        let icons_dir = tempfile::tempdir().unwrap();
        let http = Arc::new(enricher(IconStore::open(icons_dir.path()).unwrap()));
        let h = harness_with(http);

        let good = serve(device_ui()).await.port();
        let broken = serve(broken_icon_ui()).await.port();
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();

        let observation = host("127.0.0.1", &[(good, "http"), (broken, "http"), (closed, "http-alt")]);
        h.scanner.answer("10.0.0.0/24", Ok(vec![observation]));

        let snapshot = h.engine.run_cycle().await.unwrap();

        let services = &snapshot.hosts[0].services;
        assert_eq!(services.len(), 3);
        let by_port: HashMap<u16, &EnrichedService> = services.iter().map(|s| (s.port(), s)).collect();
        assert_eq!(by_port[&good].display_name, "Router Admin");
        assert!(by_port[&good].icon.is_some());
        assert_eq!(by_port[&broken].display_name, "Camera");
        assert!(by_port[&broken].icon.is_none());
        assert_eq!(by_port[&closed].display_name, "http-alt");
        assert_eq!(h.overlay.current().host("127.0.0.1").unwrap().services.len(), 3);
    }

    #[tokio::test]
    async fn test_cycle_runs_on_spawned_task() {
        let h = harness();
        let nas = Observation {
            hostname: Some("nas.lan".to_string()),
            ..host("10.0.0.5", &[(80, "http"), (443, "https")])
        };
        h.scanner.answer("10.0.0.0/24", Ok(vec![nas]));

        let engine = Arc::new(h.engine);
        let snapshot = tokio::spawn(async move { engine.run_cycle().await })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(snapshot.hosts[0].hostname.as_deref(), Some("nas.lan"));
        assert_eq!(snapshot.hosts[0].services.len(), 2);
        assert!(h.overlay.current().host("10.0.0.5").is_some());
    }
}
