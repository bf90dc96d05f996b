//! Process-wide room registry
//!
//! Maps room tokens to their orchestrators. The registry mutex only guards
//! the map; it is always released before any orchestrator operation so a
//! slow room cannot block the control plane.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, OnceCell};

use lt_config::constants::server as server_consts;
use lt_config::Settings;
use lt_core::{HpbSettings, ReconnectMethod, SigConnectResult};
use lt_transport::room::RoomOrchestrator;

use crate::error::ProviderError;
use crate::hpb;

pub struct RoomRegistry {
    settings: Settings,
    rooms: Mutex<HashMap<String, Arc<RoomOrchestrator>>>,
    hpb_settings: OnceCell<HpbSettings>,
    closed_tx: mpsc::UnboundedSender<String>,
}

impl RoomRegistry {
    /// Create the registry and its reaper task, which removes entries for
    /// orchestrators that tore themselves down.
    pub fn new(settings: Settings) -> Arc<Self> {
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<String>();
        let registry = Arc::new(Self {
            settings,
            rooms: Mutex::new(HashMap::new()),
            hpb_settings: OnceCell::new(),
            closed_tx,
        });

        let weak = Arc::downgrade(&registry);
        tokio::spawn(async move {
            while let Some(room_token) = closed_rx.recv().await {
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                let mut rooms = registry.rooms.lock().await;
                if rooms
                    .get(&room_token)
                    .map(|room| room.is_defunct())
                    .unwrap_or(false)
                {
                    rooms.remove(&room_token);
                    tracing::debug!(room = %room_token, "removed defunct room from registry");
                }
            }
        });

        registry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Signaling settings (STUN/TURN) are fetched once per process.
    async fn hpb_settings(&self) -> HpbSettings {
        self.hpb_settings
            .get_or_init(|| async {
                match hpb::fetch_signaling_settings(&self.settings).await {
                    Ok(settings) => settings,
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "could not fetch signaling settings, joining without STUN/TURN"
                        );
                        HpbSettings::default()
                    }
                }
            })
            .await
            .clone()
    }

    /// Ensure an orchestrator exists for the room and register the
    /// recipient. Creates and connects the orchestrator on first use.
    pub async fn enable(
        &self,
        room_token: &str,
        nc_session_id: &str,
        lang_id: &str,
    ) -> Result<(), ProviderError> {
        let existing = {
            let rooms = self.rooms.lock().await;
            rooms
                .get(room_token)
                .filter(|room| !room.is_defunct())
                .cloned()
        };
        if let Some(room) = existing {
            room.start(nc_session_id).await;
            tracing::info!(
                room = %room_token,
                nc_session_id,
                "added recipient to existing room"
            );
            return Ok(());
        }

        let hpb_settings = self.hpb_settings().await;
        let room = {
            let mut rooms = self.rooms.lock().await;
            // Lost a creation race with a concurrent enable?
            match rooms.get(room_token).filter(|r| !r.is_defunct()).cloned() {
                Some(room) => room,
                None => {
                    tracing::info!(room = %room_token, lang_id, "creating room orchestrator");
                    let room = RoomOrchestrator::new(
                        room_token,
                        self.settings.clone(),
                        hpb_settings,
                        lang_id,
                        self.closed_tx.clone(),
                    );
                    rooms.insert(room_token.to_string(), room.clone());
                    room
                }
            }
        };

        // Connect outside the registry lock.
        match room.connect(ReconnectMethod::Fresh).await {
            SigConnectResult::Failure => {
                self.rooms.lock().await.remove(room_token);
                return Err(ProviderError::Unavailable(
                    "failed to connect to the signaling server".into(),
                ));
            }
            SigConnectResult::Retry => {
                tracing::debug!(
                    room = %room_token,
                    "connection being retried, registering recipient anyway"
                );
            }
            SigConnectResult::Success => {}
        }

        room.start(nc_session_id).await;
        tracing::info!(room = %room_token, nc_session_id, lang_id, "started transcription");
        Ok(())
    }

    /// Deregister a recipient; the room leaves on its own once empty.
    pub async fn disable(&self, room_token: &str, nc_session_id: &str) {
        let room = self.rooms.lock().await.get(room_token).cloned();
        if let Some(room) = room {
            room.stop(nc_session_id).await;
            tracing::info!(room = %room_token, nc_session_id, "removed transcription recipient");
        }
    }

    /// Change the transcription language of an active room.
    pub async fn set_language(&self, room_token: &str, lang_id: &str) -> Result<(), ProviderError> {
        let room = self.rooms.lock().await.get(room_token).cloned();
        match room.filter(|room| !room.is_defunct()) {
            Some(room) => {
                room.set_language(lang_id).await;
                Ok(())
            }
            None => Err(ProviderError::NotFound(format!(
                "no active transcription session for room {room_token}"
            ))),
        }
    }

    /// Immediately shut one room down.
    pub async fn leave(&self, room_token: &str) {
        let room = self.rooms.lock().await.get(room_token).cloned();
        if let Some(room) = room {
            room.close().await;
            tracing::info!(room = %room_token, "left call");
        }
    }

    /// Tokens of rooms that are still alive.
    pub async fn active_rooms(&self) -> Vec<String> {
        let rooms = self.rooms.lock().await;
        rooms
            .iter()
            .filter(|(_, room)| !room.is_defunct())
            .map(|(token, _)| token.clone())
            .collect()
    }

    /// Drain and close every room, bounded per room.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down room registry");
        let rooms: Vec<Arc<RoomOrchestrator>> = {
            let mut map = self.rooms.lock().await;
            map.drain().map(|(_, room)| room).collect()
        };
        for room in rooms {
            if tokio::time::timeout(server_consts::SHUTDOWN_TIMEOUT, room.close())
                .await
                .is_err()
            {
                tracing::warn!(
                    room = %room.room_token(),
                    "timeout closing room during shutdown"
                );
            }
        }
        tracing::info!("room registry shutdown complete");
    }
}
