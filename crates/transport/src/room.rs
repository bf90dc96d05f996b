//! Room orchestrator
//!
//! One per Talk room. Owns the signaling client, the recipient set, the
//! per-speaker subscribers and pipelines, the transcript fan-out and the
//! whole connect/reconnect/teardown lifecycle.
//!
//! All mutable room state lives behind one async mutex; the mutex is never
//! held across network I/O. Long-running work (signaling reader, fan-out
//! consumer, timers) runs as separate tasks that are aborted on teardown.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use lt_config::constants::signaling as sig_consts;
use lt_config::Settings;
use lt_core::audio::AudioFrame;
use lt_core::{call_flag, HpbSettings, ReconnectMethod, SigConnectResult, Transcript};
use lt_pipeline::{SttConfig, TranscriptionSession};

use crate::signaling::{HandshakeOutcome, ResumeOutcome, SignalingClient};
use crate::subscriber::{PeerSubscriber, SubscriberEvents};

pub type RoomHandle = Arc<RoomOrchestrator>;

/// Connection state of a room. `Defunct` is terminal and sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Connecting,
    Connected,
    Defunct,
}

/// One speaker's running transcription pipeline.
struct SpeakerPipeline {
    language: Arc<parking_lot::Mutex<String>>,
    task: JoinHandle<()>,
}

/// Mutable room state, serialized by the per-room mutex.
#[derive(Default)]
struct Shared {
    /// HPB session ids that receive transcripts.
    recipients: HashSet<String>,
    /// External session ids waiting for their HPB mapping.
    pending_recipients: HashSet<String>,
    /// External session id -> HPB session id, per connection.
    nc_to_hpb: HashMap<String, String>,
    /// Speaker HPB session id -> pipeline.
    transcribers: HashMap<String, SpeakerPipeline>,
    /// Speaker HPB session id -> subscriber.
    subscribers: HashMap<String, Arc<PeerSubscriber>>,
}

#[derive(Default)]
struct SessionIds {
    session_id: Option<String>,
    resume_id: Option<String>,
}

#[derive(Default)]
struct TaskSlots {
    monitor: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
    deferred_close: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

pub struct RoomOrchestrator {
    room_token: String,
    settings: Settings,
    hpb_settings: HpbSettings,
    signaling: SignalingClient,
    lang_id: parking_lot::Mutex<String>,
    state: parking_lot::Mutex<RoomState>,
    /// Set once teardown starts; gates every outbound send.
    closing: AtomicBool,
    session_ids: parking_lot::Mutex<SessionIds>,
    shared: AsyncMutex<Shared>,
    outbox_tx: mpsc::Sender<Transcript>,
    outbox_rx: AsyncMutex<mpsc::Receiver<Transcript>>,
    tasks: parking_lot::Mutex<TaskSlots>,
    reconnect_attempts: AtomicU32,
    /// Notifies the registry when this room has torn itself down.
    closed_tx: mpsc::UnboundedSender<String>,
}

impl RoomOrchestrator {
    pub fn new(
        room_token: impl Into<String>,
        settings: Settings,
        hpb_settings: HpbSettings,
        lang_id: &str,
        closed_tx: mpsc::UnboundedSender<String>,
    ) -> Arc<Self> {
        let signaling = SignalingClient::new(
            &settings.hpb_url,
            &settings.hpb_internal_secret,
            &settings.backend_url,
            settings.skip_cert_verify,
        );
        let (outbox_tx, outbox_rx) = mpsc::channel(sig_consts::TRANSCRIPT_OUTBOX_DEPTH);

        Arc::new(Self {
            room_token: room_token.into(),
            settings,
            hpb_settings,
            signaling,
            lang_id: parking_lot::Mutex::new(lang_id.to_string()),
            state: parking_lot::Mutex::new(RoomState::Connecting),
            closing: AtomicBool::new(false),
            session_ids: parking_lot::Mutex::new(SessionIds::default()),
            shared: AsyncMutex::new(Shared::default()),
            outbox_tx,
            outbox_rx: AsyncMutex::new(outbox_rx),
            tasks: parking_lot::Mutex::new(TaskSlots::default()),
            reconnect_attempts: AtomicU32::new(0),
            closed_tx,
        })
    }

    pub fn room_token(&self) -> &str {
        &self.room_token
    }

    pub fn state(&self) -> RoomState {
        *self.state.lock()
    }

    pub fn is_defunct(&self) -> bool {
        self.closing.load(Ordering::SeqCst) || self.state() == RoomState::Defunct
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_ids.lock().session_id.clone()
    }

    pub fn language(&self) -> String {
        self.lang_id.lock().clone()
    }

    // ---- connect state machine ----

    /// Run the connect state machine for `mode`.
    pub async fn connect(self: &Arc<Self>, mode: ReconnectMethod) -> SigConnectResult {
        if self.closing.load(Ordering::SeqCst) {
            return SigConnectResult::Failure;
        }

        if self.signaling.is_open() && mode != ReconnectMethod::FullReconnect {
            tracing::debug!(room = %self.room_token, "already connected, skipping connect");
            return SigConnectResult::Success;
        }

        if let Err(e) = self.signaling.open().await {
            tracing::warn!(
                room = %self.room_token,
                error = %e,
                "error connecting to signaling server"
            );
            if mode != ReconnectMethod::Fresh {
                self.schedule_reconnect(ReconnectMethod::FullReconnect);
            }
            return SigConnectResult::Retry;
        }

        match mode {
            ReconnectMethod::ShortResume => self.connect_resume().await,
            ReconnectMethod::Fresh | ReconnectMethod::FullReconnect => {
                self.connect_fresh(mode).await
            }
        }
    }

    async fn connect_resume(self: &Arc<Self>) -> SigConnectResult {
        let resume_id = self.session_ids.lock().resume_id.clone();
        let Some(resume_id) = resume_id else {
            self.schedule_reconnect(ReconnectMethod::FullReconnect);
            return SigConnectResult::Retry;
        };

        match self.signaling.resume(&resume_id).await {
            ResumeOutcome::Resumed { session_id } => {
                self.session_ids.lock().session_id = Some(session_id);
                tracing::info!(room = %self.room_token, "resumed signaling connection");
                self.after_connect(false).await
            }
            ResumeOutcome::RateLimited => {
                tracing::error!(
                    room = %self.room_token,
                    "rate limited during short resume, giving up"
                );
                self.spawn_close();
                SigConnectResult::Failure
            }
            ResumeOutcome::Expired | ResumeOutcome::Failed => {
                tracing::info!(
                    room = %self.room_token,
                    "short resume failed, performing full reconnect"
                );
                self.schedule_reconnect(ReconnectMethod::FullReconnect);
                SigConnectResult::Retry
            }
        }
    }

    async fn connect_fresh(self: &Arc<Self>, mode: ReconnectMethod) -> SigConnectResult {
        if mode == ReconnectMethod::FullReconnect {
            tracing::info!(room = %self.room_token, "performing full reconnect");
            self.reset_connection_state().await;
        }

        match self.signaling.authenticate().await {
            HandshakeOutcome::Established {
                session_id,
                resume_id,
            } => {
                tracing::debug!(
                    room = %self.room_token,
                    session_id = %session_id,
                    "signaling hello received"
                );
                {
                    let mut ids = self.session_ids.lock();
                    ids.session_id = Some(session_id);
                    ids.resume_id = Some(resume_id);
                }
                self.after_connect(mode == ReconnectMethod::Fresh).await
            }
            HandshakeOutcome::Retry => {
                if mode != ReconnectMethod::Fresh {
                    self.schedule_reconnect(ReconnectMethod::FullReconnect);
                }
                SigConnectResult::Retry
            }
            HandshakeOutcome::Failure(failure) => {
                tracing::error!(
                    room = %self.room_token,
                    ?failure,
                    "signaling handshake failed"
                );
                if mode != ReconnectMethod::Fresh {
                    self.spawn_close();
                }
                SigConnectResult::Failure
            }
        }
    }

    /// Post-handshake wiring shared by fresh connects and resumes.
    async fn after_connect(self: &Arc<Self>, start_deferred_close: bool) -> SigConnectResult {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        *self.state.lock() = RoomState::Connected;
        self.spawn_monitor();
        self.ensure_consumer();
        if start_deferred_close {
            // Leave again shortly unless a recipient actually registers.
            self.spawn_deferred_close();
        }

        let session_id = self.session_ids.lock().session_id.clone().unwrap_or_default();
        let sent = self.signaling.send_incall().await.is_ok()
            && self
                .signaling
                .send_join(&self.room_token, &session_id)
                .await
                .is_ok();
        if !sent {
            tracing::warn!(room = %self.room_token, "socket dropped right after handshake");
            *self.state.lock() = RoomState::Connecting;
            self.schedule_reconnect(ReconnectMethod::ShortResume);
            return SigConnectResult::Retry;
        }

        tracing::info!(room = %self.room_token, "connected to signaling server");
        SigConnectResult::Success
    }

    /// Tear down everything tied to the previous connection; recipients
    /// fall back to pending so the next participant update re-promotes them.
    async fn reset_connection_state(&self) {
        let (pipelines, subscribers) = {
            let mut shared = self.shared.lock().await;
            let demoted: Vec<String> = shared
                .nc_to_hpb
                .iter()
                .filter(|(_, hpb)| shared.recipients.contains(*hpb))
                .map(|(nc, _)| nc.clone())
                .collect();
            shared.pending_recipients.extend(demoted);
            shared.recipients.clear();
            shared.nc_to_hpb.clear();
            (
                shared
                    .transcribers
                    .drain()
                    .map(|(_, p)| p)
                    .collect::<Vec<_>>(),
                shared
                    .subscribers
                    .drain()
                    .map(|(_, s)| s)
                    .collect::<Vec<_>>(),
            )
        };
        for pipeline in &pipelines {
            pipeline.task.abort();
        }
        for subscriber in subscribers {
            subscriber.close().await;
        }
        let mut ids = self.session_ids.lock();
        ids.session_id = None;
        ids.resume_id = None;
    }

    /// Schedule a reconnect with exponential backoff; gives up and closes
    /// the room after `max_connection_retries` attempts.
    fn schedule_reconnect(self: &Arc<Self>, mode: ReconnectMethod) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        {
            let tasks = self.tasks.lock();
            if let Some(handle) = &tasks.reconnect {
                if !handle.is_finished() {
                    return;
                }
            }
        }

        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.settings.max_connection_retries {
            tracing::error!(
                room = %self.room_token,
                attempts = attempt,
                "giving up on reconnecting"
            );
            self.spawn_close();
            return;
        }

        *self.state.lock() = RoomState::Connecting;
        let delay = Duration::from_secs(
            self.settings
                .retry_backoff_base
                .saturating_pow(attempt + 1),
        );
        tracing::info!(
            room = %self.room_token,
            ?mode,
            delay_secs = delay.as_secs(),
            "scheduling reconnect"
        );

        let this = self.clone();
        self.tasks.lock().reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Free the slot first: the connect below may need to schedule
            // the next attempt itself.
            this.tasks.lock().reconnect.take();
            let _ = this.connect(mode).await;
        }));
    }

    // ---- recipients ----

    /// Register a transcript recipient by its external session id.
    pub async fn start(self: &Arc<Self>, nc_session_id: &str) {
        {
            let mut shared = self.shared.lock().await;
            match shared.nc_to_hpb.get(nc_session_id).cloned() {
                Some(hpb_sid) => {
                    shared.pending_recipients.remove(nc_session_id);
                    if shared.recipients.insert(hpb_sid) {
                        tracing::debug!(
                            room = %self.room_token,
                            nc_session_id,
                            "added transcript recipient"
                        );
                    }
                }
                None => {
                    tracing::debug!(
                        room = %self.room_token,
                        nc_session_id,
                        "HPB session unknown, deferring recipient"
                    );
                    shared.pending_recipients.insert(nc_session_id.to_string());
                }
            }
        }
        self.cancel_deferred_close();
    }

    /// Deregister a recipient; an empty room schedules a deferred leave.
    pub async fn stop(self: &Arc<Self>, nc_session_id: &str) {
        let emptied = {
            let mut shared = self.shared.lock().await;
            shared.pending_recipients.remove(nc_session_id);
            match shared.nc_to_hpb.get(nc_session_id).cloned() {
                Some(hpb_sid) => {
                    if shared.recipients.remove(&hpb_sid) {
                        tracing::debug!(
                            room = %self.room_token,
                            nc_session_id,
                            "removed transcript recipient"
                        );
                    }
                    shared.recipients.is_empty() && shared.pending_recipients.is_empty()
                }
                None => shared.recipients.is_empty() && shared.pending_recipients.is_empty(),
            }
        };
        if emptied {
            self.spawn_deferred_close();
        }
    }

    /// Change the room language and propagate it to every pipeline.
    pub async fn set_language(self: &Arc<Self>, lang_id: &str) {
        *self.lang_id.lock() = lang_id.to_string();
        let shared = self.shared.lock().await;
        for pipeline in shared.transcribers.values() {
            *pipeline.language.lock() = lang_id.to_string();
        }
        tracing::info!(room = %self.room_token, lang_id, "changed transcription language");
    }

    // ---- lifecycle tasks ----

    fn spawn_monitor(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if let Some(handle) = tasks.monitor.take() {
            handle.abort();
        }
        tasks.monitor = Some(tokio::spawn(self.clone().run_monitor()));
    }

    fn ensure_consumer(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        let running = tasks
            .consumer
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        if !running {
            tasks.consumer = Some(tokio::spawn(self.clone().run_consumer()));
        }
    }

    fn spawn_deferred_close(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if let Some(handle) = tasks.deferred_close.take() {
            handle.abort();
        }
        let grace = Duration::from_millis(self.settings.call_leave_timeout_ms);
        let this = self.clone();
        tasks.deferred_close = Some(tokio::spawn(async move {
            tracing::debug!(
                room = %this.room_token,
                grace_ms = grace.as_millis() as u64,
                "leaving the call unless a recipient arrives"
            );
            tokio::time::sleep(grace).await;
            if this.closing.load(Ordering::SeqCst) {
                return;
            }
            let empty = {
                let shared = this.shared.lock().await;
                shared.recipients.is_empty() && shared.pending_recipients.is_empty()
            };
            if empty {
                tracing::debug!(
                    room = %this.room_token,
                    "no transcript recipients after grace period, leaving the call"
                );
                this.spawn_close();
            }
        }));
    }

    fn cancel_deferred_close(&self) {
        if let Some(handle) = self.tasks.lock().deferred_close.take() {
            handle.abort();
        }
    }

    /// Close from a context that `close` would otherwise cancel (monitor,
    /// timers, subscriber callbacks).
    fn spawn_close(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.close().await;
        });
    }

    /// Tear the room down. Idempotent; after this the orchestrator is
    /// Defunct and emits nothing further.
    pub async fn close(self: &Arc<Self>) {
        if self.closing.swap(true, Ordering::SeqCst) {
            tracing::debug!(room = %self.room_token, "already closing, skipping");
            return;
        }
        tracing::info!(room = %self.room_token, "closing room orchestrator");

        {
            let mut tasks = self.tasks.lock();
            for handle in [
                tasks.deferred_close.take(),
                tasks.reconnect.take(),
                tasks.monitor.take(),
                tasks.consumer.take(),
            ]
            .into_iter()
            .flatten()
            {
                handle.abort();
            }
        }

        if self.signaling.is_open() {
            let _ = tokio::time::timeout(Duration::from_secs(5), self.signaling.send_bye()).await;
        }

        let (pipelines, subscribers) = {
            let mut shared = self.shared.lock().await;
            shared.recipients.clear();
            shared.pending_recipients.clear();
            shared.nc_to_hpb.clear();
            (
                shared
                    .transcribers
                    .drain()
                    .map(|(_, p)| p)
                    .collect::<Vec<_>>(),
                shared
                    .subscribers
                    .drain()
                    .map(|(_, s)| s)
                    .collect::<Vec<_>>(),
            )
        };
        for pipeline in &pipelines {
            pipeline.task.abort();
        }
        for subscriber in subscribers {
            subscriber.close().await;
        }

        {
            let mut outbox = self.outbox_rx.lock().await;
            while outbox.try_recv().is_ok() {}
        }

        self.signaling.close().await;
        {
            let mut ids = self.session_ids.lock();
            ids.session_id = None;
            ids.resume_id = None;
        }
        *self.state.lock() = RoomState::Defunct;
        let _ = self.closed_tx.send(self.room_token.clone());
        tracing::info!(room = %self.room_token, "room orchestrator closed");
    }

    // ---- signaling dispatcher ----

    async fn run_monitor(self: Arc<Self>) {
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            let msg = match self.signaling.recv().await {
                Ok(msg) => msg,
                Err(e) => {
                    if self.closing.load(Ordering::SeqCst) {
                        return;
                    }
                    tracing::warn!(
                        room = %self.room_token,
                        error = %e,
                        "signaling socket error, scheduling short resume"
                    );
                    *self.state.lock() = RoomState::Connecting;
                    self.schedule_reconnect(ReconnectMethod::ShortResume);
                    return;
                }
            };
            if self.dispatch(msg).await.is_break() {
                return;
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, msg: Value) -> ControlFlow<()> {
        match msg.get("type").and_then(|t| t.as_str()).unwrap_or("") {
            "error" => {
                let code = msg["error"]["code"].as_str().unwrap_or("");
                tracing::error!(
                    room = %self.room_token,
                    code,
                    message = msg["error"]["message"].as_str().unwrap_or(""),
                    "signaling error message received"
                );
                if code == "processing_failed" {
                    return ControlFlow::Continue(());
                }
                self.spawn_close();
                ControlFlow::Break(())
            }
            "event" => {
                let event = &msg["event"];
                if event["target"].as_str() == Some("participants")
                    && event["type"].as_str() == Some("update")
                {
                    return self.handle_participants_update(&event["update"]).await;
                }
                ControlFlow::Continue(())
            }
            "message" => {
                match msg["message"]["data"]["type"].as_str().unwrap_or("") {
                    "offer" => self.handle_offer(&msg).await,
                    "candidate" => self.handle_candidate(&msg).await,
                    _ => {}
                }
                ControlFlow::Continue(())
            }
            "bye" => {
                tracing::debug!(room = %self.room_token, "received bye, closing");
                self.spawn_close();
                ControlFlow::Break(())
            }
            _ => ControlFlow::Continue(()),
        }
    }

    async fn handle_participants_update(self: &Arc<Self>, update: &Value) -> ControlFlow<()> {
        if update["all"].as_bool() == Some(true) && update["incall"].as_u64() == Some(0) {
            tracing::debug!(room = %self.room_token, "call ended for everyone, closing");
            self.spawn_close();
            return ControlFlow::Break(());
        }

        let Some(users) = update["users"].as_array() else {
            return ControlFlow::Continue(());
        };
        if users.is_empty() {
            return ControlFlow::Continue(());
        }

        let mut offers_needed: Vec<String> = Vec::new();
        let mut promoted = false;
        let mut recipients_emptied = false;
        {
            let mut shared = self.shared.lock().await;
            for user in users {
                if user["internal"].as_bool() == Some(true) {
                    continue;
                }
                let Some(sid) = user["sessionId"].as_str() else {
                    continue;
                };
                let incall = user["inCall"].as_u64().unwrap_or(0) as u32;

                if incall == call_flag::DISCONNECTED {
                    tracing::debug!(
                        room = %self.room_token,
                        session_id = sid,
                        "participant disconnected"
                    );
                    if let Some(pipeline) = shared.transcribers.remove(sid) {
                        pipeline.task.abort();
                    }
                    if shared.recipients.remove(sid) && shared.recipients.is_empty() {
                        recipients_emptied = shared.pending_recipients.is_empty();
                    }
                    if let Some(nc_sid) = user["nextcloudSessionId"].as_str() {
                        shared.nc_to_hpb.remove(nc_sid);
                    }
                    continue;
                }

                if let Some(nc_sid) = user["nextcloudSessionId"].as_str() {
                    shared
                        .nc_to_hpb
                        .insert(nc_sid.to_string(), sid.to_string());
                    if shared.pending_recipients.remove(nc_sid) {
                        tracing::debug!(
                            room = %self.room_token,
                            nc_session_id = nc_sid,
                            "promoting deferred recipient"
                        );
                        shared.recipients.insert(sid.to_string());
                        promoted = true;
                    }
                }

                if incall & call_flag::IN_CALL != 0 && incall & call_flag::WITH_AUDIO != 0 {
                    let live = shared
                        .subscribers
                        .get(sid)
                        .map(|s| s.is_live())
                        .unwrap_or(false);
                    if !live {
                        offers_needed.push(sid.to_string());
                    } else {
                        tracing::debug!(
                            room = %self.room_token,
                            session_id = sid,
                            "peer connection already exists, skipping offer request"
                        );
                    }
                }
            }
        }

        if promoted {
            self.cancel_deferred_close();
        } else if recipients_emptied {
            self.spawn_deferred_close();
        }

        for sid in offers_needed {
            tracing::debug!(
                room = %self.room_token,
                session_id = %sid,
                "participant joined with audio, requesting offer"
            );
            if self.signaling.send_request_offer(&sid).await.is_err() {
                break;
            }
        }

        let my_sid = self.session_ids.lock().session_id.clone();
        if last_peer_left(users, my_sid.as_deref()) {
            tracing::debug!(room = %self.room_token, "last peer left the call, closing");
            self.spawn_close();
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    async fn handle_offer(self: &Arc<Self>, msg: &Value) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        let Some(spkr) = msg["message"]["sender"]["sessionid"].as_str() else {
            return;
        };
        let Some(sdp) = msg["message"]["data"]["payload"]["sdp"].as_str() else {
            return;
        };
        let offer_sid = match &msg["message"]["data"]["sid"] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        {
            let shared = self.shared.lock().await;
            if shared
                .subscribers
                .get(spkr)
                .map(|s| s.is_live())
                .unwrap_or(false)
            {
                tracing::debug!(
                    room = %self.room_token,
                    session_id = spkr,
                    "peer connection already exists, skipping offer"
                );
                return;
            }
        }

        let events: Arc<dyn SubscriberEvents> = self.clone();
        let subscriber =
            match PeerSubscriber::new(spkr.to_string(), &self.hpb_settings, events.clone()).await {
                Ok(subscriber) => Arc::new(subscriber),
                Err(e) => {
                    tracing::error!(
                        room = %self.room_token,
                        session_id = spkr,
                        error = %e,
                        "failed to create peer subscriber"
                    );
                    return;
                }
            };

        // Registered before the SDP exchange so trickled candidates from the
        // publisher find their subscriber.
        let replaced = self
            .shared
            .lock()
            .await
            .subscribers
            .insert(spkr.to_string(), subscriber.clone());
        if let Some(old) = replaced {
            old.close().await;
        }

        if self.closing.load(Ordering::SeqCst) {
            subscriber.close().await;
            return;
        }

        if let Err(e) = subscriber.complete(&offer_sid, sdp, &events).await {
            tracing::error!(
                room = %self.room_token,
                session_id = spkr,
                error = %e,
                "SDP exchange failed"
            );
            subscriber.close().await;
            self.shared.lock().await.subscribers.remove(spkr);
        }
    }

    async fn handle_candidate(self: &Arc<Self>, msg: &Value) {
        let Some(sender) = msg["message"]["sender"]["sessionid"].as_str() else {
            return;
        };
        let payload = &msg["message"]["data"]["payload"]["candidate"];
        let Some(candidate) = payload["candidate"].as_str() else {
            return;
        };
        let sdp_mid = payload["sdpMid"].as_str().map(String::from);
        let sdp_mline_index = payload["sdpMLineIndex"].as_u64().map(|i| i as u16);

        let subscriber = self.shared.lock().await.subscribers.get(sender).cloned();
        let Some(subscriber) = subscriber else {
            return;
        };
        if let Err(e) = subscriber
            .add_ice_candidate(candidate.to_string(), sdp_mid, sdp_mline_index)
            .await
        {
            tracing::debug!(
                room = %self.room_token,
                session_id = sender,
                error = %e,
                "failed to add remote ICE candidate"
            );
        }
    }

    // ---- transcript fan-out ----

    async fn run_consumer(self: Arc<Self>) {
        tracing::debug!(room = %self.room_token, "starting transcript consumer");
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            if self.state() != RoomState::Connected {
                tokio::time::sleep(sig_consts::CONSUMER_IDLE_POLL).await;
                continue;
            }

            let transcript = {
                let mut outbox = self.outbox_rx.lock().await;
                match outbox.recv().await {
                    Some(transcript) => transcript,
                    None => return,
                }
            };

            if tokio::time::timeout(
                sig_consts::TRANSCRIPT_SEND_TIMEOUT,
                self.send_transcript(&transcript),
            )
            .await
            .is_err()
            {
                tracing::warn!(
                    room = %self.room_token,
                    speaker = %transcript.speaker_session_id,
                    "timed out sending a transcript, dropping it"
                );
            }
        }
    }

    async fn send_transcript(&self, transcript: &Transcript) {
        let recipients: Vec<String> = {
            let shared = self.shared.lock().await;
            shared.recipients.iter().cloned().collect()
        };
        if recipients.is_empty() {
            tracing::trace!(room = %self.room_token, "no recipients, skipping transcript");
            return;
        }

        let preview: String = transcript.message.chars().take(120).collect();
        tracing::debug!(
            room = %self.room_token,
            speaker = %transcript.speaker_session_id,
            is_final = transcript.is_final,
            recipients = recipients.len(),
            preview = %preview,
            "sending transcript"
        );
        for sid in recipients {
            if let Err(e) = self.signaling.send_transcript(&sid, transcript).await {
                tracing::warn!(
                    room = %self.room_token,
                    recipient = %sid,
                    error = %e,
                    "failed to send transcript"
                );
                break;
            }
        }
    }
}

#[async_trait]
impl SubscriberEvents for RoomOrchestrator {
    async fn send_answer(&self, speaker: &str, offer_sid: &str, sdp: &str) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        match self.signaling.send_answer(speaker, offer_sid, sdp).await {
            Ok(()) => {
                tracing::debug!(
                    room = %self.room_token,
                    session_id = speaker,
                    "sent answer for offer"
                );
            }
            Err(e) => {
                tracing::warn!(
                    room = %self.room_token,
                    session_id = speaker,
                    error = %e,
                    "failed to send answer"
                );
            }
        }
    }

    async fn send_candidate(&self, speaker: &str, offer_sid: &str, candidate: &str) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .signaling
            .send_candidate(speaker, offer_sid, candidate)
            .await
        {
            tracing::warn!(
                room = %self.room_token,
                session_id = speaker,
                error = %e,
                "failed to send candidate"
            );
        }
    }

    async fn subscriber_closed(&self, speaker: &str) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        if self
            .shared
            .lock()
            .await
            .subscribers
            .remove(speaker)
            .is_some()
        {
            tracing::debug!(
                room = %self.room_token,
                session_id = speaker,
                "removed subscriber after connection failure"
            );
        }
    }

    async fn start_transcriber(&self, speaker: &str, frames: mpsc::Receiver<AudioFrame>) -> bool {
        if self.closing.load(Ordering::SeqCst) {
            return false;
        }

        let language = Arc::new(parking_lot::Mutex::new(self.language()));
        let session = TranscriptionSession::new(
            speaker,
            SttConfig::from_settings(&self.settings),
            language.clone(),
            Duration::from_secs(self.settings.stale_timeout_secs),
        );

        // Connect before any frames flow so a cold start cannot queue up
        // stale audio. Failure here only loses this speaker.
        let stream = match session.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(
                    room = %self.room_token,
                    speaker,
                    error = %e,
                    "failed to start transcriber"
                );
                return false;
            }
        };

        let outbox = self.outbox_tx.clone();
        let room = self.room_token.clone();
        let speaker_owned = speaker.to_string();
        let task = tokio::spawn(async move {
            if let Err(e) = session.run(stream, frames, outbox).await {
                tracing::error!(
                    room = %room,
                    speaker = %speaker_owned,
                    error = %e,
                    "transcription pipeline failed"
                );
            }
        });

        let mut shared = self.shared.lock().await;
        if let Some(previous) = shared
            .transcribers
            .insert(speaker.to_string(), SpeakerPipeline { language, task })
        {
            previous.task.abort();
        }
        tracing::debug!(
            room = %self.room_token,
            speaker,
            lang_id = %self.language(),
            "started transcriber"
        );
        true
    }
}

/// Exactly two users in the update, we are one of them, we are still in the
/// call and the other is disconnected.
fn last_peer_left(users: &[Value], my_session_id: Option<&str>) -> bool {
    if users.len() != 2 {
        return false;
    }
    let Some(my_sid) = my_session_id else {
        return false;
    };
    let Some(me) = users
        .iter()
        .position(|u| u["sessionId"].as_str() == Some(my_sid))
    else {
        return false;
    };
    let other = &users[me ^ 1];

    let my_incall = users[me]["inCall"].as_u64().unwrap_or(0) as u32;
    let other_incall = other["inCall"].as_u64().unwrap_or(0) as u32;
    my_incall & call_flag::IN_CALL != 0 && other_incall == call_flag::DISCONNECTED
}
