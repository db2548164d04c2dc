//! The position engine: sessions, recomputation, online fallback and status.

use cellfix_common::{CellObservation, Fix, Notification, PositionReport, ProviderStatus, SubscriberOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::arbitration::{self, Arbitration};
use super::cache::{CacheStatistics, CellLocationCache};
use super::session::SessionTable;
use super::status::StatusMachine;
use super::triangulation::{self, ResolvedCell, ZeroSignalPolicy};
use super::{Clock, FIX_TIMEOUT, QUIT_IDLE_TIME};
use crate::error::{OnlineError, ProviderError, Result};
use crate::module::cells::CellSource;
use crate::module::online::{OnlineFix, OnlineLocator, OnlineQuery};
use crate::module::settings::LocationSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Shuts the service down when nobody is subscribed
    Idle,
    /// Demotes Available to Acquiring
    FixLost,
    /// Periodic position recalculation
    Recompute,
}

impl TimerKind {
    pub fn repeats(&self) -> bool {
        matches!(self, TimerKind::Recompute)
    }
}

/// Side effects requested by the engine, carried out by the service loop in order
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ArmTimer(TimerKind, Duration),
    CancelTimer(TimerKind),
    Notify(Notification),
    /// Submit `query`; the result must come back tagged with `lookup`
    Locate { lookup: u64, query: OnlineQuery },
    Shutdown,
}

/// The outstanding online lookup and the observations it was built from
#[derive(Debug)]
struct InFlightLookup {
    lookup: u64,
    observations: Vec<CellObservation>,
}

pub struct PositionEngine {
    cache: CellLocationCache,
    cells: Box<dyn CellSource>,
    online: Option<Arc<dyn OnlineLocator>>,
    clock: Arc<dyn Clock>,
    zero_signal_policy: ZeroSignalPolicy,

    sessions: SessionTable,
    status: StatusMachine,
    settings: LocationSettings,
    positioning_enabled: bool,
    positioning_started: bool,

    current: Fix,
    previous: Fix,

    /// Set by change notifications, forces the next recompute tick to calculate
    cells_changed: bool,
    environment_changed: bool,

    previous_query: Option<OnlineQuery>,
    in_flight: Option<InFlightLookup>,
    next_lookup: u64,

    actions: Vec<Action>,
}

impl PositionEngine {
    pub fn new(cache: CellLocationCache, cells: Box<dyn CellSource>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            cells,
            online: None,
            clock,
            zero_signal_policy: ZeroSignalPolicy::default(),
            sessions: SessionTable::new(),
            status: StatusMachine::new(),
            settings: LocationSettings::default(),
            positioning_enabled: false,
            positioning_started: false,
            current: Fix::invalid(),
            previous: Fix::invalid(),
            cells_changed: false,
            environment_changed: false,
            previous_query: None,
            in_flight: None,
            next_lookup: 0,
            actions: Vec::new(),
        }
    }

    pub fn with_online(mut self, online: Arc<dyn OnlineLocator>) -> Self {
        self.online = Some(online);
        self
    }

    pub fn with_zero_signal_policy(mut self, policy: ZeroSignalPolicy) -> Self {
        self.zero_signal_policy = policy;
        self
    }

    /// Apply the initial settings and arm the idle timer.
    pub fn boot(&mut self, settings: LocationSettings) {
        info!("Cell positioning provider active");
        self.apply_settings(settings);

        if self.sessions.is_empty() {
            self.arm(TimerKind::Idle, QUIT_IDLE_TIME);
        }

        if self.positioning_enabled {
            self.cells_changed = true;
        } else {
            info!("Positioning is not currently enabled, idling");
        }
    }

    /// Drain the actions produced since the last call
    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    pub fn status(&self) -> ProviderStatus {
        self.status.status()
    }

    pub fn position(&self) -> PositionReport {
        if self.current.is_valid() {
            debug!(
                "GetPosition: ts {} lat {} lon {} accuracy {}",
                self.current.timestamp_millis,
                self.current.latitude,
                self.current.longitude,
                self.current.accuracy.horizontal
            );
        } else {
            debug!("GetPosition: no valid current location known");
        }
        self.current.report()
    }

    pub fn current_fix(&self) -> &Fix {
        &self.current
    }

    pub fn previous_fix(&self) -> &Fix {
        &self.previous
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn cache_statistics(&self) -> CacheStatistics {
        self.cache.statistics()
    }

    /// Id of the online lookup currently awaited, if any
    pub fn pending_lookup(&self) -> Option<u64> {
        self.in_flight.as_ref().map(|in_flight| in_flight.lookup)
    }

    pub fn is_started(&self) -> bool {
        self.positioning_started
    }

    pub fn online(&self) -> Option<Arc<dyn OnlineLocator>> {
        self.online.clone()
    }

    pub fn add_reference(&mut self, caller: &str) {
        let was_inactive = self.sessions.add_reference(caller);
        debug!("Reference added by {} ({} subscribers)", caller, self.sessions.len());

        if was_inactive {
            debug!("New watched service, stopping idle timer");
            self.cancel(TimerKind::Idle);
        }

        self.start_if_needed();
    }

    pub fn remove_reference(&mut self, caller: &str) {
        self.sessions.remove_reference(caller);
        debug!("Reference removed by {} ({} subscribers)", caller, self.sessions.len());

        if self.sessions.is_empty() {
            debug!("No watched services, starting idle timer");
            self.arm(TimerKind::Idle, QUIT_IDLE_TIME);
        }

        self.stop_if_needed();
    }

    /// The caller went away without releasing its references.
    pub fn disconnect(&mut self, caller: &str) {
        if !self.sessions.disconnect(caller) {
            return;
        }
        info!("Subscriber {} disconnected", caller);

        if self.sessions.is_empty() {
            debug!("No watched services, starting idle timer");
            self.arm(TimerKind::Idle, QUIT_IDLE_TIME);
        }

        self.stop_if_needed();
    }

    pub fn set_options(&mut self, caller: &str, options: &SubscriberOptions) -> Result<()> {
        if !self.sessions.contains(caller) {
            warn!("Only active users can set options, rejecting {}", caller);
            return Err(ProviderError::NotSubscribed(caller.to_string()));
        }

        if let Some(interval) = options.update_interval {
            self.sessions.set_update_interval(caller, interval)?;
            let effective = self.sessions.effective_interval();
            debug!("{} requested {} ms, recalculating every {} ms", caller, interval, effective);

            if self.positioning_started {
                self.arm(TimerKind::Recompute, Duration::from_millis(effective as u64));
            }
        }

        Ok(())
    }

    pub fn on_timer(&mut self, timer: TimerKind) {
        match timer {
            TimerKind::Idle => {
                info!("Have been idle for too long, quitting");
                self.actions.push(Action::Shutdown);
            }
            TimerKind::FixLost => {
                if let Some(status) = self.status.fix_lost() {
                    info!("No position update for {:?}, status is now {}", FIX_TIMEOUT, status);
                    self.notify(Notification::StatusChanged { status });
                }
            }
            TimerKind::Recompute => self.recompute(),
        }
    }

    pub fn on_cells_changed(&mut self) {
        self.cells_changed = true;
    }

    pub fn on_environment_changed(&mut self) {
        self.environment_changed = true;
    }

    pub fn on_settings_changed(&mut self, settings: LocationSettings) {
        self.apply_settings(settings);
    }

    /// Completion of online lookup `lookup`. Results of lookups abandoned by a stop are dropped.
    pub fn on_online_result(&mut self, lookup: u64, result: std::result::Result<OnlineFix, OnlineError>) {
        if self.pending_lookup() != Some(lookup) {
            debug!("Ignoring result of abandoned online lookup {}", lookup);
            return;
        }
        let Some(InFlightLookup { observations, .. }) = self.in_flight.take() else {
            return;
        };

        match result {
            Ok(found) => {
                debug!(
                    "Location from online service: {}, {} ({} m)",
                    found.latitude, found.longitude, found.accuracy
                );
                let now = self.clock.now_millis();
                let candidate = Fix::new(now, found.latitude, found.longitude, found.accuracy);
                self.adopt(candidate, now);
            }
            Err(e) => {
                debug!("Cannot fetch position from online source: {}, falling back to offline source", e);
                self.update_from_cells(&observations);
            }
        }
    }

    fn apply_settings(&mut self, settings: LocationSettings) {
        settings.log_summary();
        if let Some(online) = &self.online {
            online.set_wlan_data_allowed(settings.wlan_data_allowed);
        }
        self.settings = settings;

        let enabled = settings.positioning_active();
        if enabled == self.positioning_enabled {
            return;
        }

        self.positioning_enabled = enabled;
        if enabled {
            info!("Positioning has been enabled");
            self.start_if_needed();
        } else {
            info!("Positioning has been disabled");
            self.set_location(Fix::invalid());
            self.stop_if_needed();
        }
    }

    fn start_if_needed(&mut self) {
        if self.positioning_started || self.sessions.is_empty() || !self.positioning_enabled {
            return;
        }

        self.cancel(TimerKind::Idle);

        info!("Starting positioning");
        self.positioning_started = true;
        self.calculate();

        let interval = self.sessions.effective_interval();
        self.arm(TimerKind::Recompute, Duration::from_millis(interval as u64));
    }

    fn stop_if_needed(&mut self) {
        if !self.positioning_started {
            return;
        }
        if self.positioning_enabled && !self.sessions.is_empty() {
            return;
        }

        info!("Stopping positioning");
        self.positioning_started = false;
        self.set_status(ProviderStatus::Unavailable);
        self.cancel(TimerKind::FixLost);
        self.cancel(TimerKind::Recompute);

        if let Some(abandoned) = self.in_flight.take() {
            debug!("Abandoning online lookup {}", abandoned.lookup);
        }
    }

    fn recompute(&mut self) {
        if !self.positioning_enabled {
            debug!("Positioning is disabled, skipping calculation");
            return;
        }
        if self.in_flight.is_some() {
            debug!("Online lookup still in flight, skipping calculation");
            return;
        }

        let now = self.clock.now_millis();
        let change_pending = self.cells_changed || self.environment_changed;
        if arbitration::should_recompute(&self.current, now, change_pending) {
            debug!("Calculating new position information");
            self.cells_changed = false;
            self.environment_changed = false;
            self.calculate();
        } else {
            debug!("Re-using old position information");
            let current = self.current;
            self.set_location(current);
        }
    }

    fn observations(&self) -> Vec<CellObservation> {
        if !self.settings.cell_data_allowed {
            return Vec::new();
        }
        self.cells.observations()
    }

    fn calculate(&mut self) {
        if self.in_flight.is_some() {
            debug!("Online lookup still in flight, skipping calculation");
            return;
        }

        let observations = self.observations();

        if self.settings.online_active() {
            if let Some(online) = &self.online {
                if let Some(query) = online.build_query(&observations, self.previous_query.as_ref()) {
                    self.next_lookup += 1;
                    let lookup = self.next_lookup;
                    self.previous_query = Some(query.clone());
                    self.in_flight = Some(InFlightLookup { lookup, observations });
                    self.actions.push(Action::Locate { lookup, query });
                    return;
                }
            }
        }

        self.update_from_cells(&observations);
    }

    fn update_from_cells(&mut self, observations: &[CellObservation]) {
        let resolved: Vec<ResolvedCell> = observations
            .iter()
            .filter_map(|observation| {
                self.cache.resolve(&observation.identity).map(|coordinates| ResolvedCell {
                    identity: observation.identity,
                    coordinates,
                    signal_strength: observation.signal_strength,
                })
            })
            .collect();

        let stats = self.cache_statistics();
        debug!(
            "Resolved {} of {} cells (cache: {} known, {} unknown, {}/{} hits)",
            resolved.len(),
            observations.len(),
            stats.known,
            stats.unknown,
            stats.hits,
            stats.lookups
        );

        let now = self.clock.now_millis();
        if let Some(candidate) = triangulation::estimate(&resolved, self.zero_signal_policy, now) {
            self.adopt(candidate, now);
        }
    }

    fn adopt(&mut self, candidate: Fix, now: i64) {
        match arbitration::arbitrate(&self.current, &candidate, now) {
            Arbitration::Adopt => self.set_location(candidate),
            Arbitration::Retain => {
                debug!(
                    "Re-using old position information due to better accuracy: preferring {}, {} ({} m) over {}, {} ({} m)",
                    self.current.latitude,
                    self.current.longitude,
                    self.current.accuracy.horizontal,
                    candidate.latitude,
                    candidate.longitude,
                    candidate.accuracy.horizontal
                );
                let current = self.current;
                self.set_location(current);
            }
        }
    }

    fn set_location(&mut self, fix: Fix) {
        debug!(
            "Setting current location to ts {} lat {} lon {} accuracy {}",
            fix.timestamp_millis, fix.latitude, fix.longitude, fix.accuracy.horizontal
        );

        if fix.is_valid() {
            self.set_status(ProviderStatus::Available);
            self.arm(TimerKind::FixLost, FIX_TIMEOUT);
            if fix.timestamp_millis != self.current.timestamp_millis {
                self.previous = self.current;
            }
        } else {
            debug!("Location invalid, lost positioning fix");
            self.previous = Fix::invalid();
            self.cancel(TimerKind::FixLost);
            self.set_status(ProviderStatus::Unavailable);
        }

        self.current = fix;
        self.notify(Notification::PositionChanged {
            position: fix.report(),
        });
    }

    fn set_status(&mut self, status: ProviderStatus) {
        if let Some(status) = self.status.transition(status) {
            info!("Status changed to {}", status);
            self.notify(Notification::StatusChanged { status });
        }
    }

    fn notify(&mut self, notification: Notification) {
        self.actions.push(Action::Notify(notification));
    }

    fn arm(&mut self, timer: TimerKind, after: Duration) {
        self.actions.push(Action::ArmTimer(timer, after));
    }

    fn cancel(&mut self, timer: TimerKind) {
        self.actions.push(Action::CancelTimer(timer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::engine::CellLocator;
    use crate::module::online::{CellTower, GeolocateRequest};
    use async_trait::async_trait;
    use cellfix_common::{CellIdentity, CellType, Coordinates, PositionFields};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

    const START: i64 = 1_700_000_000_000;

    #[derive(Clone)]
    struct ManualClock(Arc<AtomicI64>);

    impl ManualClock {
        fn advance(&self, millis: i64) {
            self.0.fetch_add(millis, Ordering::SeqCst);
        }

        fn now(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> i64 {
            self.now()
        }
    }

    #[derive(Clone, Default)]
    struct SharedCells(Arc<Mutex<Vec<CellObservation>>>);

    impl SharedCells {
        fn set(&self, cells: Vec<CellObservation>) {
            *self.0.lock().unwrap() = cells;
        }
    }

    impl CellSource for SharedCells {
        fn observations(&self) -> Vec<CellObservation> {
            self.0.lock().unwrap().clone()
        }
    }

    struct MapLocator {
        cells: HashMap<CellIdentity, Coordinates>,
        lookups: Arc<AtomicUsize>,
    }

    impl CellLocator for MapLocator {
        fn lookup(&self, identity: &CellIdentity) -> Option<Coordinates> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.cells.get(identity).copied()
        }
    }

    #[derive(Default)]
    struct FakeOnline {
        decline: bool,
        queries: Mutex<Vec<usize>>,
        wlan_allowed: AtomicBool,
    }

    #[async_trait]
    impl OnlineLocator for FakeOnline {
        fn build_query(&self, observations: &[CellObservation], _previous: Option<&OnlineQuery>) -> Option<OnlineQuery> {
            if self.decline {
                return None;
            }
            self.queries.lock().unwrap().push(observations.len());
            Some(OnlineQuery {
                built_at: chrono::Utc::now(),
                request: GeolocateRequest {
                    consider_ip: false,
                    cell_towers: observations.iter().map(CellTower::from).collect(),
                    wifi_access_points: Vec::new(),
                },
            })
        }

        async fn locate(&self, _query: &OnlineQuery) -> std::result::Result<OnlineFix, OnlineError> {
            Err(OnlineError::NotFound)
        }

        fn set_wlan_data_allowed(&self, allowed: bool) {
            self.wlan_allowed.store(allowed, Ordering::SeqCst);
        }
    }

    fn cell(cid: u32) -> CellIdentity {
        CellIdentity::new(CellType::Gsm, cid, 1021, 244, 91)
    }

    fn seen(cid: u32, strength: u32) -> CellObservation {
        CellObservation::new(cell(cid), strength)
    }

    /// Cells 1-3 form the reference triangle, 4-12 all sit on the same site.
    fn known_cells() -> HashMap<CellIdentity, Coordinates> {
        let mut cells = HashMap::new();
        cells.insert(cell(1), Coordinates::new(0.0, 0.0));
        cells.insert(cell(2), Coordinates::new(0.0, 10.0));
        cells.insert(cell(3), Coordinates::new(10.0, 0.0));
        for cid in 4..=12 {
            cells.insert(cell(cid), Coordinates::new(60.0, 24.0));
        }
        cells
    }

    fn enabled() -> LocationSettings {
        LocationSettings {
            positioning_enabled: true,
            cell_positioning_enabled: true,
            online_positioning_enabled: false,
            online_data_allowed: true,
            cell_data_allowed: true,
            wlan_data_allowed: true,
        }
    }

    fn online_enabled() -> LocationSettings {
        LocationSettings {
            online_positioning_enabled: true,
            ..enabled()
        }
    }

    struct Harness {
        engine: PositionEngine,
        clock: ManualClock,
        cells: SharedCells,
        lookups: Arc<AtomicUsize>,
    }

    fn harness_with(settings: LocationSettings, online: Option<Arc<FakeOnline>>) -> Harness {
        let clock = ManualClock(Arc::new(AtomicI64::new(START)));
        let cells = SharedCells::default();
        let lookups = Arc::new(AtomicUsize::new(0));
        let locator = MapLocator {
            cells: known_cells(),
            lookups: lookups.clone(),
        };

        let mut engine = PositionEngine::new(
            CellLocationCache::new(Box::new(locator)),
            Box::new(cells.clone()),
            Arc::new(clock.clone()),
        );
        if let Some(online) = online {
            engine = engine.with_online(online);
        }
        engine.boot(settings);

        Harness {
            engine,
            clock,
            cells,
            lookups,
        }
    }

    fn harness(settings: LocationSettings) -> Harness {
        harness_with(settings, None)
    }

    fn notifications(actions: &[Action]) -> Vec<Notification> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Notify(notification) => Some(notification.clone()),
                _ => None,
            })
            .collect()
    }

    fn positions(actions: &[Action]) -> Vec<PositionReport> {
        notifications(actions)
            .into_iter()
            .filter_map(|notification| match notification {
                Notification::PositionChanged { position } => Some(position),
                _ => None,
            })
            .collect()
    }

    fn statuses(actions: &[Action]) -> Vec<ProviderStatus> {
        notifications(actions)
            .into_iter()
            .filter_map(|notification| match notification {
                Notification::StatusChanged { status } => Some(status),
                _ => None,
            })
            .collect()
    }

    fn armed(actions: &[Action], timer: TimerKind) -> Option<Duration> {
        actions.iter().rev().find_map(|action| match action {
            Action::ArmTimer(kind, after) if *kind == timer => Some(*after),
            _ => None,
        })
    }

    fn cancelled(actions: &[Action], timer: TimerKind) -> bool {
        actions.contains(&Action::CancelTimer(timer))
    }

    fn queries(actions: &[Action]) -> Vec<OnlineQuery> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Locate { query, .. } => Some(query.clone()),
                _ => None,
            })
            .collect()
    }

    fn submitted(actions: &[Action]) -> Vec<u64> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Locate { lookup, .. } => Some(*lookup),
                _ => None,
            })
            .collect()
    }

    /// Start with a 2500 m fix from eight co-located cells.
    fn start_with_accurate_fix(h: &mut Harness) -> i64 {
        h.cells.set((4..=11).map(|cid| seen(cid, 10)).collect());
        h.engine.add_reference("app");
        let actions = h.engine.take_actions();
        let fix = positions(&actions)[0];
        assert_eq!(fix.accuracy.horizontal, 2500.0);
        h.engine.current_fix().timestamp_millis
    }

    #[test]
    fn test_boot_arms_idle_timer() {
        let mut h = harness(enabled());
        let actions = h.engine.take_actions();
        assert_eq!(armed(&actions, TimerKind::Idle), Some(QUIT_IDLE_TIME));
        assert!(notifications(&actions).is_empty());
    }

    #[test]
    fn test_disabled_positioning_reports_nothing() {
        let mut h = harness(LocationSettings::default());
        h.cells.set(vec![seen(1, 20), seen(2, 20), seen(3, 20)]);
        h.engine.take_actions();

        h.engine.add_reference("app");
        h.engine.on_cells_changed();
        h.engine.on_timer(TimerKind::Recompute);
        let actions = h.engine.take_actions();

        assert!(cancelled(&actions, TimerKind::Idle));
        assert!(notifications(&actions).is_empty());
        assert!(!h.engine.is_started());
        assert!(h.engine.position().fields.is_empty());
        assert_eq!(h.engine.status(), ProviderStatus::Unavailable);
        assert_eq!(h.lookups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_first_subscriber_starts_positioning() {
        let mut h = harness(enabled());
        h.cells.set(vec![seen(1, 20), seen(2, 20), seen(3, 20)]);
        h.engine.take_actions();

        h.engine.add_reference("app");
        let actions = h.engine.take_actions();

        assert!(cancelled(&actions, TimerKind::Idle));
        assert_eq!(armed(&actions, TimerKind::Recompute), Some(Duration::from_millis(10_000)));
        assert_eq!(armed(&actions, TimerKind::FixLost), Some(FIX_TIMEOUT));

        // Status change is observable before the position it results from
        let notifications = notifications(&actions);
        assert_eq!(notifications.len(), 2);
        assert_eq!(
            notifications[0],
            Notification::StatusChanged {
                status: ProviderStatus::Available
            }
        );
        let Notification::PositionChanged { position } = notifications[1] else {
            panic!("expected a position notification");
        };
        assert!((position.latitude - 10.0 / 3.0).abs() < 1e-9);
        assert!((position.longitude - 10.0 / 3.0).abs() < 1e-9);
        assert_eq!(position.accuracy.horizontal, 7000.0);
        assert_eq!(position.fields, PositionFields::LATITUDE | PositionFields::LONGITUDE);
        assert_eq!(position.timestamp, START / 1000);
    }

    #[test]
    fn test_fix_reused_within_reuse_interval() {
        let mut h = harness(enabled());
        let first = start_with_accurate_fix(&mut h);
        let lookups = h.lookups.load(Ordering::SeqCst);

        // Cells move but nobody told us
        h.cells.set(vec![seen(1, 10)]);
        h.clock.advance(10_000);
        h.engine.on_timer(TimerKind::Recompute);
        let actions = h.engine.take_actions();

        let reported = positions(&actions);
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].timestamp, first / 1000);
        assert_eq!(h.engine.current_fix().timestamp_millis, first);
        assert_eq!(h.lookups.load(Ordering::SeqCst), lookups);
    }

    #[test]
    fn test_cell_change_forces_recompute() {
        let mut h = harness(enabled());
        start_with_accurate_fix(&mut h);
        let lookups = h.lookups.load(Ordering::SeqCst);

        h.cells.set(vec![seen(1, 20), seen(2, 20), seen(3, 20)]);
        h.engine.on_cells_changed();
        h.clock.advance(10_000);
        h.engine.on_timer(TimerKind::Recompute);
        let actions = h.engine.take_actions();
        assert_eq!(h.lookups.load(Ordering::SeqCst), lookups + 3);

        // 7000 m is worse than the fresh 2500 m fix, so it is computed but discarded
        let reported = positions(&actions);
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].accuracy.horizontal, 2500.0);

        // The pending change was consumed, the next tick re-uses the fix
        h.cells.set(vec![seen(12, 20)]);
        h.clock.advance(10_000);
        h.engine.on_timer(TimerKind::Recompute);
        h.engine.take_actions();
        assert_eq!(h.lookups.load(Ordering::SeqCst), lookups + 3);
    }

    #[test]
    fn test_worse_fix_retained_until_fallback_interval() {
        let mut h = harness(enabled());
        let first = start_with_accurate_fix(&mut h);

        h.cells.set(vec![seen(1, 10)]);
        h.clock.advance(40_000);
        h.engine.on_timer(TimerKind::Recompute);
        let actions = h.engine.take_actions();
        assert_eq!(positions(&actions)[0].accuracy.horizontal, 2500.0);
        assert_eq!(h.engine.current_fix().timestamp_millis, first);

        h.clock.advance(90_000);
        h.engine.on_timer(TimerKind::Recompute);
        let actions = h.engine.take_actions();
        let reported = positions(&actions);
        assert_eq!(reported[0].accuracy.horizontal, 9000.0);
        assert_eq!(h.engine.current_fix().timestamp_millis, h.clock.now());
        assert_eq!(h.engine.previous_fix().timestamp_millis, first);
    }

    #[test]
    fn test_no_resolved_cells_keeps_current_fix() {
        let mut h = harness(enabled());
        let first = start_with_accurate_fix(&mut h);

        h.cells.set(vec![seen(99, 30)]);
        h.engine.on_cells_changed();
        h.clock.advance(40_000);
        h.engine.on_timer(TimerKind::Recompute);
        let actions = h.engine.take_actions();

        assert!(notifications(&actions).is_empty());
        assert_eq!(h.engine.current_fix().timestamp_millis, first);
        assert_eq!(h.engine.status(), ProviderStatus::Available);
    }

    #[test]
    fn test_fix_lost_transitions_once() {
        let mut h = harness(enabled());
        start_with_accurate_fix(&mut h);

        h.engine.on_timer(TimerKind::FixLost);
        let actions = h.engine.take_actions();
        assert_eq!(statuses(&actions), vec![ProviderStatus::Acquiring]);

        h.engine.on_timer(TimerKind::FixLost);
        assert!(h.engine.take_actions().is_empty());
        assert_eq!(h.engine.status(), ProviderStatus::Acquiring);

        // A re-emitted fix makes the provider available again
        h.clock.advance(10_000);
        h.engine.on_timer(TimerKind::Recompute);
        let actions = h.engine.take_actions();
        assert_eq!(statuses(&actions), vec![ProviderStatus::Available]);
    }

    #[test]
    fn test_reference_counting() {
        let mut h = harness(enabled());
        h.cells.set(vec![seen(1, 20)]);
        for _ in 0..3 {
            h.engine.add_reference("app");
        }
        h.engine.take_actions();

        h.engine.remove_reference("app");
        h.engine.remove_reference("app");
        let actions = h.engine.take_actions();
        assert!(h.engine.is_started());
        assert!(armed(&actions, TimerKind::Idle).is_none());
        assert!(!cancelled(&actions, TimerKind::Recompute));

        h.engine.remove_reference("app");
        let actions = h.engine.take_actions();
        assert!(h.engine.sessions().is_empty());
        assert!(!h.engine.is_started());
        assert_eq!(armed(&actions, TimerKind::Idle), Some(QUIT_IDLE_TIME));
        assert!(cancelled(&actions, TimerKind::Recompute));
        assert!(cancelled(&actions, TimerKind::FixLost));
        assert_eq!(statuses(&actions), vec![ProviderStatus::Unavailable]);
    }

    #[test]
    fn test_disconnect_drops_subscriber() {
        let mut h = harness(enabled());
        h.cells.set(vec![seen(1, 20)]);
        h.engine.add_reference("app");
        h.engine.add_reference("app");
        h.engine.take_actions();

        h.engine.disconnect("app");
        let actions = h.engine.take_actions();
        assert!(h.engine.sessions().is_empty());
        assert_eq!(armed(&actions, TimerKind::Idle), Some(QUIT_IDLE_TIME));
        assert!(!h.engine.is_started());

        // Unknown callers are ignored
        h.engine.disconnect("app");
        assert!(h.engine.take_actions().is_empty());
    }

    #[test]
    fn test_set_options() {
        let mut h = harness(enabled());
        h.cells.set(vec![seen(1, 20)]);
        h.engine.take_actions();

        let err = h
            .engine
            .set_options("stranger", &SubscriberOptions { update_interval: Some(5000) })
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotSubscribed(_)));
        assert!(h.engine.take_actions().is_empty());

        for caller in ["a", "b", "c"] {
            h.engine.add_reference(caller);
        }
        h.engine.take_actions();

        h.engine
            .set_options("a", &SubscriberOptions { update_interval: Some(0) })
            .unwrap();
        h.engine
            .set_options("c", &SubscriberOptions { update_interval: Some(50_000) })
            .unwrap();
        let actions = h.engine.take_actions();
        assert_eq!(armed(&actions, TimerKind::Recompute), Some(Duration::from_millis(50_000)));

        h.engine
            .set_options("b", &SubscriberOptions { update_interval: Some(5000) })
            .unwrap();
        let actions = h.engine.take_actions();
        assert_eq!(armed(&actions, TimerKind::Recompute), Some(Duration::from_millis(10_000)));

        // No interval in the options leaves the timer alone
        h.engine.set_options("b", &SubscriberOptions::default()).unwrap();
        assert!(h.engine.take_actions().is_empty());
    }

    #[test]
    fn test_idle_timer_shuts_down() {
        let mut h = harness(enabled());
        h.engine.take_actions();
        h.engine.on_timer(TimerKind::Idle);
        assert_eq!(h.engine.take_actions(), vec![Action::Shutdown]);
    }

    #[test]
    fn test_disabling_positioning_invalidates_fix() {
        let mut h = harness(enabled());
        start_with_accurate_fix(&mut h);

        h.engine.on_settings_changed(LocationSettings::default());
        let actions = h.engine.take_actions();

        let notifications = notifications(&actions);
        assert_eq!(
            notifications[0],
            Notification::StatusChanged {
                status: ProviderStatus::Unavailable
            }
        );
        let Notification::PositionChanged { position } = notifications[1] else {
            panic!("expected a position notification");
        };
        assert!(position.fields.is_empty());
        assert_eq!(notifications.len(), 2);
        assert!(cancelled(&actions, TimerKind::Recompute));
        assert!(!h.engine.is_started());
        assert!(!h.engine.previous_fix().is_valid());

        // More subscribers do not bring it back
        h.engine.add_reference("other");
        h.engine.on_timer(TimerKind::Recompute);
        let actions = h.engine.take_actions();
        assert!(positions(&actions).is_empty());
        assert!(h.engine.position().fields.is_empty());
        assert_eq!(h.engine.status(), ProviderStatus::Unavailable);
    }

    #[test]
    fn test_enabling_starts_for_existing_subscribers() {
        let mut h = harness(LocationSettings::default());
        h.cells.set(vec![seen(1, 20), seen(2, 20)]);
        h.engine.add_reference("app");
        h.engine.take_actions();

        h.engine.on_settings_changed(enabled());
        let actions = h.engine.take_actions();
        assert!(h.engine.is_started());
        assert_eq!(positions(&actions).len(), 1);
        assert_eq!(h.engine.status(), ProviderStatus::Available);
    }

    #[test]
    fn test_cell_data_not_allowed() {
        let settings = LocationSettings {
            cell_data_allowed: false,
            ..enabled()
        };
        let mut h = harness(settings);
        h.cells.set(vec![seen(1, 20), seen(2, 20)]);
        h.engine.add_reference("app");
        let actions = h.engine.take_actions();

        assert!(h.engine.is_started());
        assert!(positions(&actions).is_empty());
        assert_eq!(h.engine.status(), ProviderStatus::Unavailable);
    }

    #[test]
    fn test_online_failure_falls_back_to_submitted_cells() {
        let online = Arc::new(FakeOnline::default());
        let mut h = harness_with(online_enabled(), Some(online.clone()));
        h.cells.set(vec![seen(1, 20), seen(2, 20), seen(3, 20)]);
        h.engine.add_reference("app");
        let actions = h.engine.take_actions();

        let submitted = queries(&actions);
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].request.cell_towers.len(), 3);
        assert!(positions(&actions).is_empty());

        // The modem moves on before the service answers
        h.cells.set(vec![seen(4, 20)]);
        let lookup = h.engine.pending_lookup().unwrap();
        h.engine.on_online_result(lookup, Err(OnlineError::Status(503)));
        let actions = h.engine.take_actions();

        let reported = positions(&actions);
        assert_eq!(reported.len(), 1);
        assert!((reported[0].latitude - 10.0 / 3.0).abs() < 1e-9);
        assert_eq!(reported[0].accuracy.horizontal, 7000.0);
    }

    #[test]
    fn test_online_fix_goes_through_arbitration() {
        let online = Arc::new(FakeOnline::default());
        let mut h = harness_with(online_enabled(), Some(online.clone()));
        h.cells.set(vec![seen(1, 20)]);
        h.engine.add_reference("app");
        h.engine.take_actions();

        let lookup = h.engine.pending_lookup().unwrap();
        h.engine.on_online_result(lookup, Ok(OnlineFix {
            latitude: 60.17,
            longitude: 24.94,
            accuracy: 150.0,
        }));
        let actions = h.engine.take_actions();
        assert_eq!(statuses(&actions), vec![ProviderStatus::Available]);
        let first = positions(&actions)[0];
        assert_eq!(first.accuracy.horizontal, 150.0);
        assert_eq!(first.latitude, 60.17);

        h.clock.advance(40_000);
        h.engine.on_environment_changed();
        h.engine.on_timer(TimerKind::Recompute);
        let second = submitted(&h.engine.take_actions());
        assert_eq!(second.len(), 1);
        assert_ne!(second[0], lookup);

        h.engine.on_online_result(second[0], Ok(OnlineFix {
            latitude: 61.0,
            longitude: 25.0,
            accuracy: 5000.0,
        }));
        let actions = h.engine.take_actions();
        let reported = positions(&actions)[0];
        assert_eq!(reported.accuracy.horizontal, 150.0);
        assert_eq!(reported.timestamp, first.timestamp);
    }

    #[test]
    fn test_one_online_lookup_at_a_time() {
        let online = Arc::new(FakeOnline::default());
        let mut h = harness_with(online_enabled(), Some(online.clone()));
        h.cells.set(vec![seen(1, 20)]);
        h.engine.add_reference("app");
        h.engine.take_actions();

        h.clock.advance(40_000);
        h.engine.on_cells_changed();
        h.engine.on_timer(TimerKind::Recompute);
        let actions = h.engine.take_actions();
        assert!(queries(&actions).is_empty());
        assert!(notifications(&actions).is_empty());

        let lookup = h.engine.pending_lookup().unwrap();
        h.engine.on_online_result(lookup, Err(OnlineError::NotFound));
        h.engine.take_actions();

        // The skipped change is still pending
        h.clock.advance(10_000);
        h.engine.on_timer(TimerKind::Recompute);
        assert_eq!(queries(&h.engine.take_actions()).len(), 1);
        assert_eq!(online.queries.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_online_declined_uses_offline_immediately() {
        let online = Arc::new(FakeOnline {
            decline: true,
            ..FakeOnline::default()
        });
        let mut h = harness_with(online_enabled(), Some(online));
        h.cells.set(vec![seen(1, 20)]);
        h.engine.add_reference("app");
        let actions = h.engine.take_actions();

        assert!(queries(&actions).is_empty());
        assert_eq!(positions(&actions)[0].accuracy.horizontal, 9000.0);
    }

    #[test]
    fn test_online_not_used_without_data_permission() {
        let online = Arc::new(FakeOnline::default());
        let settings = LocationSettings {
            online_data_allowed: false,
            ..online_enabled()
        };
        let mut h = harness_with(settings, Some(online.clone()));
        h.cells.set(vec![seen(1, 20)]);
        h.engine.add_reference("app");
        let actions = h.engine.take_actions();

        assert!(queries(&actions).is_empty());
        assert_eq!(positions(&actions).len(), 1);
        assert!(online.queries.lock().unwrap().is_empty());
    }

    #[test]
    fn test_result_dropped_after_stop() {
        let online = Arc::new(FakeOnline::default());
        let mut h = harness_with(online_enabled(), Some(online));
        h.cells.set(vec![seen(1, 20)]);
        h.engine.add_reference("app");
        let lookup = submitted(&h.engine.take_actions())[0];
        h.engine.remove_reference("app");
        h.engine.take_actions();
        assert_eq!(h.engine.pending_lookup(), None);

        h.engine.on_online_result(lookup, Ok(OnlineFix {
            latitude: 60.0,
            longitude: 24.0,
            accuracy: 100.0,
        }));
        assert!(h.engine.take_actions().is_empty());
        assert!(!h.engine.current_fix().is_valid());
    }

    #[test]
    fn test_restart_during_lookup_submits_again() {
        let online = Arc::new(FakeOnline::default());
        let mut h = harness_with(online_enabled(), Some(online.clone()));
        h.cells.set(vec![seen(1, 20)]);
        h.engine.add_reference("app");
        let abandoned = submitted(&h.engine.take_actions())[0];

        h.engine.remove_reference("app");
        h.engine.add_reference("app");
        let actions = h.engine.take_actions();
        let restarted = submitted(&actions);
        assert_eq!(restarted.len(), 1);
        assert_ne!(restarted[0], abandoned);
        assert_eq!(h.engine.pending_lookup(), Some(restarted[0]));
        assert_eq!(armed(&actions, TimerKind::Recompute), Some(Duration::from_millis(10_000)));

        // The answer to the first lookup arrives late and must not be adopted
        h.engine.on_online_result(abandoned, Ok(OnlineFix {
            latitude: 10.0,
            longitude: 10.0,
            accuracy: 50.0,
        }));
        assert!(h.engine.take_actions().is_empty());
        assert_eq!(h.engine.pending_lookup(), Some(restarted[0]));

        h.engine.on_online_result(restarted[0], Ok(OnlineFix {
            latitude: 60.17,
            longitude: 24.94,
            accuracy: 150.0,
        }));
        let reported = positions(&h.engine.take_actions());
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].latitude, 60.17);
        assert_eq!(h.engine.status(), ProviderStatus::Available);
        assert_eq!(online.queries.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_cache_statistics_track_resolutions() {
        let mut h = harness(enabled());
        h.cells.set(vec![seen(1, 20), seen(99, 20)]);
        h.engine.add_reference("app");
        h.engine.take_actions();

        let stats = h.engine.cache_statistics();
        assert_eq!((stats.known, stats.unknown), (1, 1));
        assert_eq!((stats.hits, stats.lookups), (0, 2));

        h.clock.advance(40_000);
        h.engine.on_cells_changed();
        h.engine.on_timer(TimerKind::Recompute);
        h.engine.take_actions();

        let stats = h.engine.cache_statistics();
        assert_eq!((stats.known, stats.unknown), (1, 1));
        assert_eq!((stats.hits, stats.lookups), (2, 2));
    }

    #[test]
    fn test_wlan_permission_forwarded() {
        let online = Arc::new(FakeOnline::default());
        let mut h = harness_with(online_enabled(), Some(online.clone()));
        assert!(online.wlan_allowed.load(Ordering::SeqCst));

        h.engine.on_settings_changed(LocationSettings {
            wlan_data_allowed: false,
            ..online_enabled()
        });
        assert!(!online.wlan_allowed.load(Ordering::SeqCst));
    }
}
