use cellfix_common::{Notification, PositionReport, ProviderStatus, SubscriberOptions};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{OnlineError, ProviderError, Result};
use crate::module::engine::{Action, CacheStatistics, PositionEngine, TimerKind};
use crate::module::online::{OnlineFix, OnlineQuery};
use crate::module::scheduled::Scheduler;
use crate::module::settings::LocationSettings;

const NOTIFICATION_CAPACITY: usize = 64;

/// Everything the service loop reacts to, in arrival order
#[derive(Debug)]
pub enum Event {
    AddReference {
        caller: String,
        reply: oneshot::Sender<()>,
    },
    RemoveReference {
        caller: String,
        reply: oneshot::Sender<()>,
    },
    Disconnected(String),
    SetOptions {
        caller: String,
        options: SubscriberOptions,
        reply: oneshot::Sender<Result<()>>,
    },
    GetStatus(oneshot::Sender<ProviderStatus>),
    GetPosition(oneshot::Sender<PositionReport>),
    GetCacheStatistics(oneshot::Sender<CacheStatistics>),
    Timer {
        timer: TimerKind,
        generation: u64,
    },
    CellsChanged,
    EnvironmentChanged,
    SettingsChanged(LocationSettings),
    OnlineResult {
        lookup: u64,
        result: std::result::Result<OnlineFix, OnlineError>,
    },
}

/// Cloneable handle to a running [`PositionService`]
#[derive(Clone)]
pub struct ProviderHandle {
    events: mpsc::UnboundedSender<Event>,
    notifications: broadcast::Sender<Notification>,
}

impl ProviderHandle {
    async fn request<T>(&self, event: impl FnOnce(oneshot::Sender<T>) -> Event) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(event(reply))?;
        response.await.map_err(|_| ProviderError::ServiceStopped)
    }

    pub async fn add_reference(&self, caller: &str) -> Result<()> {
        self.request(|reply| Event::AddReference {
            caller: caller.to_string(),
            reply,
        })
        .await
    }

    pub async fn remove_reference(&self, caller: &str) -> Result<()> {
        self.request(|reply| Event::RemoveReference {
            caller: caller.to_string(),
            reply,
        })
        .await
    }

    pub async fn set_options(&self, caller: &str, options: SubscriberOptions) -> Result<()> {
        self.request(|reply| Event::SetOptions {
            caller: caller.to_string(),
            options,
            reply,
        })
        .await?
    }

    pub async fn status(&self) -> Result<ProviderStatus> {
        self.request(Event::GetStatus).await
    }

    pub async fn position(&self) -> Result<PositionReport> {
        self.request(Event::GetPosition).await
    }

    pub async fn cache_statistics(&self) -> Result<CacheStatistics> {
        self.request(Event::GetCacheStatistics).await
    }

    /// The transport lost `caller`. Safe to call from `Drop`.
    pub fn disconnect(&self, caller: &str) {
        if self.send(Event::Disconnected(caller.to_string())).is_err() {
            debug!("Service already stopped, ignoring disconnect of {}", caller);
        }
    }

    pub fn cells_changed(&self) -> Result<()> {
        self.send(Event::CellsChanged)
    }

    pub fn environment_changed(&self) -> Result<()> {
        self.send(Event::EnvironmentChanged)
    }

    pub fn settings_changed(&self, settings: LocationSettings) -> Result<()> {
        self.send(Event::SettingsChanged(settings))
    }

    /// Status and position notifications, in the order the engine produced them
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.events.is_closed()
    }

    fn send(&self, event: Event) -> Result<()> {
        self.events.send(event).map_err(|_| ProviderError::ServiceStopped)
    }
}

/// Owns the engine and serializes every event through one task
pub struct PositionService {
    engine: PositionEngine,
    settings: LocationSettings,
    events: mpsc::UnboundedReceiver<Event>,
    sender: mpsc::UnboundedSender<Event>,
    notifications: broadcast::Sender<Notification>,
    scheduler: Scheduler,
}

impl PositionService {
    pub fn new(engine: PositionEngine, settings: LocationSettings) -> (Self, ProviderHandle) {
        let (sender, events) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let handle = ProviderHandle {
            events: sender.clone(),
            notifications: notifications.clone(),
        };
        let service = Self {
            engine,
            settings,
            events,
            scheduler: Scheduler::new(sender.clone()),
            sender,
            notifications,
        };
        (service, handle)
    }

    /// Run until the idle timer fires.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.engine.boot(self.settings);
        if self.execute() {
            return Ok(());
        }

        while let Some(event) = self.events.recv().await {
            if self.handle(event) {
                info!("Position service stopped");
                break;
            }
        }

        self.scheduler.shutdown();
        Ok(())
    }

    /// Process one event. Returns true when the service should stop.
    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::AddReference { caller, reply } => {
                self.engine.add_reference(&caller);
                self.execute_then_reply(reply, ())
            }
            Event::RemoveReference { caller, reply } => {
                self.engine.remove_reference(&caller);
                self.execute_then_reply(reply, ())
            }
            Event::Disconnected(caller) => {
                self.engine.disconnect(&caller);
                self.execute()
            }
            Event::SetOptions { caller, options, reply } => {
                let result = self.engine.set_options(&caller, &options);
                self.execute_then_reply(reply, result)
            }
            Event::GetStatus(reply) => {
                let _ = reply.send(self.engine.status());
                false
            }
            Event::GetPosition(reply) => {
                let _ = reply.send(self.engine.position());
                false
            }
            Event::GetCacheStatistics(reply) => {
                let _ = reply.send(self.engine.cache_statistics());
                false
            }
            Event::Timer { timer, generation } => {
                if self.scheduler.accept(timer, generation) {
                    self.engine.on_timer(timer);
                }
                self.execute()
            }
            Event::CellsChanged => {
                debug!("Cell data changed");
                self.engine.on_cells_changed();
                false
            }
            Event::EnvironmentChanged => {
                debug!("Network environment changed");
                self.engine.on_environment_changed();
                false
            }
            Event::SettingsChanged(settings) => {
                self.engine.on_settings_changed(settings);
                self.execute()
            }
            Event::OnlineResult { lookup, result } => {
                self.engine.on_online_result(lookup, result);
                self.execute()
            }
        }
    }

    fn execute_then_reply<T>(&mut self, reply: oneshot::Sender<T>, value: T) -> bool {
        let stop = self.execute();
        let _ = reply.send(value);
        stop
    }

    /// Carry out the engine's actions in order. Returns true on shutdown.
    fn execute(&mut self) -> bool {
        let mut stop = false;
        for action in self.engine.take_actions() {
            match action {
                Action::ArmTimer(timer, after) => self.scheduler.arm(timer, after),
                Action::CancelTimer(timer) => self.scheduler.cancel(timer),
                Action::Notify(notification) => {
                    // Nobody listening is fine
                    let _ = self.notifications.send(notification);
                }
                Action::Locate { lookup, query } => self.locate(lookup, query),
                Action::Shutdown => stop = true,
            }
        }
        stop
    }

    fn locate(&self, lookup: u64, query: OnlineQuery) {
        let events = self.sender.clone();
        let Some(online) = self.engine.online() else {
            warn!("Online lookup requested without an online locator");
            let _ = events.send(Event::OnlineResult {
                lookup,
                result: Err(OnlineError::NotFound),
            });
            return;
        };

        tokio::spawn(async move {
            let result = online.locate(&query).await;
            let _ = events.send(Event::OnlineResult { lookup, result });
        });
    }
}
