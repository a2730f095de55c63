//! The relay server.
//!
//! [`RelayServer`] starts the transports enabled in the [`Config`], creates
//! the preset rooms and runs every room on its own tokio task. A room task
//! ticks its [`Room`] at the configured interval, keeps the registry's
//! occupancy current and withdraws the room once it has closed.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use rally_config::{Config, RoomPreset, TransportKind, UdpConfig};
use rally_net::{
    ContextKey, MemoryConfig, MemoryTransport, RoomId, RoomInfo, Transport, TransportError,
    UdpSettings, UdpTransport, WebSocketTransport,
};
use rally_room::{
    LogAnnouncer, RegistryError, Room, RoomError, RoomRegistry, RoomRequest, RoomSettings,
    RoomState,
};

/// Errors raised while starting the server or creating rooms.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{0:?} transport is disabled")]
    TransportDisabled(TransportKind),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Room(#[from] RoomError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A room that was created and is running.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    pub info: RoomInfo,
    pub transport: TransportKind,
    /// Address clients connect to.
    pub address: String,
}

/// Room request built from a configured preset.
pub fn preset_request(preset: &RoomPreset) -> RoomRequest {
    RoomRequest {
        name: preset.name.clone(),
        version: preset.version.clone(),
        capacity: preset.capacity,
        password: preset.password.clone(),
        attributes: preset.attributes.clone(),
    }
}

/// UDP settings from the config section.
pub fn udp_settings(config: &UdpConfig) -> UdpSettings {
    UdpSettings {
        timeout: Duration::from_millis(config.timeout_ms),
        heartbeat: Duration::from_millis(config.heartbeat_ms),
        resend: Duration::from_millis(config.resend_ms),
        max_resends: config.max_resends,
    }
}

type StopMap = Arc<DashMap<RoomId, watch::Sender<bool>>>;

/// Transports, room tasks and the room directory of one server process.
pub struct RelayServer {
    config: Config,
    registry: RoomRegistry,
    websocket: Option<WebSocketTransport>,
    udp: Option<UdpTransport>,
    memory: MemoryTransport,
    stops: StopMap,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayServer {
    /// Start the enabled transports and create the preset rooms.
    pub async fn start(config: Config) -> Result<Self, ServerError> {
        let websocket = if config.websocket.enabled {
            let transport = WebSocketTransport::new(format!(
                "{}:{}",
                config.server.bind_address, config.websocket.port
            ));
            transport.start().await?;
            Some(transport)
        } else {
            None
        };
        let udp = config.udp.enabled.then(|| {
            UdpTransport::new(
                config.server.bind_address.clone(),
                config.udp.base_port,
                udp_settings(&config.udp),
            )
        });

        let server = Self {
            registry: RoomRegistry::new(config.server.max_rooms, Arc::new(LogAnnouncer)),
            websocket,
            udp,
            memory: MemoryTransport::new(MemoryConfig::default()),
            stops: Arc::new(DashMap::new()),
            tasks: Mutex::new(Vec::new()),
            config,
        };

        for preset in &server.config.presets {
            let handle = server.create_room(preset_request(preset), preset.transport)?;
            tracing::info!("Preset room '{}' at {}", handle.info.name, handle.address);
        }
        Ok(server)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// In-process transport; rooms created with [`TransportKind::Memory`]
    /// are reachable through it.
    pub fn memory(&self) -> &MemoryTransport {
        &self.memory
    }

    /// Where the WebSocket listener is bound, if enabled.
    pub fn websocket_addr(&self) -> Option<std::net::SocketAddr> {
        self.websocket.as_ref().and_then(WebSocketTransport::local_addr)
    }

    fn transport(&self, kind: TransportKind) -> Result<&dyn Transport, ServerError> {
        let transport: Option<&dyn Transport> = match kind {
            TransportKind::WebSocket => self.websocket.as_ref().map(|t| t as &dyn Transport),
            TransportKind::Udp => self.udp.as_ref().map(|t| t as &dyn Transport),
            TransportKind::Memory => Some(&self.memory),
        };
        transport.ok_or(ServerError::TransportDisabled(kind))
    }

    fn room_settings(&self, request: &RoomRequest) -> RoomSettings {
        let defaults = &self.config.rooms;
        RoomSettings {
            name: request.name.clone(),
            version: request.version.clone(),
            capacity: request.capacity,
            password: request.password.clone(),
            attributes: request.attributes.clone(),
            rpr_ttl: Duration::from_millis(defaults.rpr_ttl_ms),
            client_id_grace: Duration::from_millis(defaults.client_id_grace_ms),
            auto_close_after: (defaults.auto_close_ms > 0)
                .then(|| Duration::from_millis(defaults.auto_close_ms)),
            max_batch_bytes: defaults.max_batch_bytes,
        }
    }

    /// Create a room on `kind` and start its task. Must be called from within
    /// a tokio runtime.
    pub fn create_room(
        &self,
        mut request: RoomRequest,
        kind: TransportKind,
    ) -> Result<RoomHandle, ServerError> {
        let transport = self.transport(kind)?;
        if request.capacity == 0 {
            request.capacity = self.config.rooms.max_clients;
        }
        let settings = self.room_settings(&request);
        let info = self.registry.create(request)?;

        let key = ContextKey::new(info.id, &info.name);
        let opened = transport
            .open_context(&key)
            .map_err(ServerError::from)
            .and_then(|backend| {
                let mut room = Room::new(info.id, settings, backend);
                room.start(Instant::now())?;
                Ok(room)
            });
        let room = match opened {
            Ok(room) => room,
            Err(e) => {
                self.registry.remove(info.id);
                return Err(e);
            }
        };
        let address = room.address().unwrap_or_default();

        let (stop, stop_rx) = watch::channel(false);
        self.stops.insert(info.id, stop);
        let tick = Duration::from_millis(self.config.server.tick_interval_ms.max(1));
        let task = tokio::spawn(run_room(
            room,
            self.registry.clone(),
            Arc::clone(&self.stops),
            tick,
            stop_rx,
        ));

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);

        Ok(RoomHandle {
            info,
            transport: kind,
            address,
        })
    }

    /// Ask a room to close. Returns `false` if it is not running.
    pub fn close_room(&self, id: RoomId) -> bool {
        match self.stops.get(&id) {
            Some(stop) => {
                stop.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Close every room, wait for their tasks and stop the listeners.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down {} rooms", self.stops.len());
        for entry in self.stops.iter() {
            entry.value().send_replace(true);
        }
        let tasks = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Room task failed: {e}");
            }
        }
        if let Some(websocket) = &self.websocket {
            websocket.shutdown();
        }
    }
}

/// Tick one room until it closes.
async fn run_room(
    mut room: Room,
    registry: RoomRegistry,
    stops: StopMap,
    tick: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let id = room.id();
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    room.request_stop();
                }
            }
        }

        let state = room.tick(Instant::now());
        if state == RoomState::Closed {
            break;
        }
        registry.update_occupancy(id, room.occupancy());
    }

    stops.remove(&id);
    registry.remove(id);
    tracing::debug!("Room {} task finished", id.0);
}
