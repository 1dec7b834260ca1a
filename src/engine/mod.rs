//! Sync engine: one exchange per host tick.
//!
//! ```text
//! Idle ──connect──▶ Handshaking ──ack──▶ Synchronizing ◀──┐
//!                        │                    │            │ handshake
//!                        └──────failure───────┴──▶ Degraded┘
//!                                                   │
//!                                   retries spent / │ mismatch
//!                                                   ▼
//!                                                 Failed        shutdown ──▶ Closed
//! ```
//!
//! Transport and codec errors never leave `on_tick`; they become status
//! transitions the host can query. The scene is only touched from `on_tick`,
//! on the caller's thread.

pub mod handshake;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::{ApiCall, Exchange, Handshake, Message, WireCodec};
use crate::config::SyncConfig;
use crate::error::{CodecError, ConnectError, RetryPolicy, SyncError, TransportError};
use crate::scene::SceneAdapter;
use crate::state::{attribute, ObjectDeclaration, ObjectState, RemoteBatch, StateCache};
use crate::transport::{AbortHandle, ConnectionState, Connector, Session, ThreadedConnector};

/// Host-visible synchronization status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No session; the scene is not touched
    Idle,
    /// Session open, declaration not yet acknowledged
    Handshaking,
    Synchronizing,
    /// Sync suspended, reconnecting with backoff
    Degraded,
    /// Gave up; only an explicit `reconnect` resumes
    Failed,
    Closed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Handshaking => "handshaking",
            SyncStatus::Synchronizing => "synchronizing",
            SyncStatus::Degraded => "degraded",
            SyncStatus::Failed => "failed",
            SyncStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cloneable handle that stops the engine from any thread.
///
/// An exchange blocked on the network is cut short; the engine reaches
/// `Closed` on the tick that observes the request.
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    abort: Arc<Mutex<Option<AbortHandle>>>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Some(abort) = self.abort.lock().as_ref() {
            abort.abort();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn arm(&self, abort: Option<AbortHandle>) {
        *self.abort.lock() = abort;
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    connector: Box<dyn Connector>,
    codec: WireCodec,
    client_id: Uuid,
    status: SyncStatus,
    session: Option<Session>,
    cache: StateCache,
    send: Vec<ObjectDeclaration>,
    receive: Vec<ObjectDeclaration>,
    declarations_changed: bool,
    retry: RetryPolicy,
    attempts: u32,
    /// A resume attempt reconnected; its handshake runs on the next tick
    resume_pending: bool,
    backoff: Duration,
    since_exchange: Duration,
    sim_time: f64,
    remote_sim_time: Option<f64>,
    api_calls: Vec<ApiCall>,
    api_results: Vec<ApiCall>,
    last_error: Option<SyncError>,
    shutdown: ShutdownHandle,
}

impl SyncEngine {
    /// Create an idle engine. With `io_thread` set, `connector` is wrapped so
    /// socket I/O runs on a dedicated thread.
    pub fn new(
        config: SyncConfig,
        connector: impl Connector + 'static,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let connector: Box<dyn Connector> = if config.io_thread {
            Box::new(ThreadedConnector::new(connector))
        } else {
            Box::new(connector)
        };

        Ok(Self {
            codec: WireCodec::new(config.wire_format),
            client_id: Uuid::new_v4(),
            status: SyncStatus::Idle,
            session: None,
            cache: StateCache::new(),
            send: config.send.clone(),
            receive: config.receive.clone(),
            declarations_changed: false,
            retry: config.retry_policy(),
            attempts: 0,
            resume_pending: false,
            backoff: Duration::ZERO,
            since_exchange: Duration::ZERO,
            sim_time: 0.0,
            remote_sim_time: None,
            api_calls: Vec::new(),
            api_results: Vec::new(),
            last_error: None,
            shutdown: ShutdownHandle::default(),
            connector,
            config,
        })
    }

    /// Open the session. The handshake runs on the next tick.
    pub fn connect(&mut self) -> Result<(), SyncError> {
        match self.status {
            SyncStatus::Closed => return Err(SyncError::InvalidState("closed")),
            SyncStatus::Handshaking | SyncStatus::Synchronizing | SyncStatus::Degraded => {
                return Err(SyncError::InvalidState("connected"))
            }
            SyncStatus::Idle | SyncStatus::Failed => {}
        }

        if let Err(err) = self.open_session() {
            warn!(error = %err, "Connect failed");
            return Err(err);
        }

        self.attempts = 0;
        self.resume_pending = false;
        self.set_status(SyncStatus::Handshaking);
        Ok(())
    }

    /// Drop whatever session exists and start over from `Idle`
    pub fn reconnect(&mut self) -> Result<(), SyncError> {
        if self.status == SyncStatus::Closed {
            return Err(SyncError::InvalidState("closed"));
        }
        self.drop_session();
        self.set_status(SyncStatus::Idle);
        self.connect()
    }

    /// Run one synchronization step. Performs at most one blocking network
    /// step (a connect, a handshake or an exchange), each bounded by the
    /// configured timeout. Never fails; inspect the returned status instead.
    pub fn on_tick<S>(&mut self, scene: &mut S, delta: Duration) -> SyncStatus
    where
        S: SceneAdapter + ?Sized,
    {
        self.sim_time += delta.as_secs_f64();

        if self.shutdown.is_requested() {
            self.shutdown();
            return self.status;
        }

        match self.status {
            SyncStatus::Idle | SyncStatus::Failed | SyncStatus::Closed => {}
            SyncStatus::Handshaking => {
                if let Err(err) = self.handshake(scene) {
                    self.handle_failure(err);
                }
            }
            SyncStatus::Synchronizing if self.declarations_changed => {
                info!("Declarations changed, handshaking again");
                self.set_status(SyncStatus::Handshaking);
                if let Err(err) = self.handshake(scene) {
                    self.handle_failure(err);
                }
            }
            SyncStatus::Synchronizing => {
                self.since_exchange += delta;
                if self.since_exchange >= self.config.exchange_interval() {
                    self.since_exchange = Duration::ZERO;
                    if let Err(err) = self.exchange(scene) {
                        self.handle_failure(err);
                    }
                }
            }
            SyncStatus::Degraded => self.degraded_tick(scene, delta),
        }

        if self.shutdown.is_requested() {
            self.shutdown();
        }
        self.status
    }

    /// Close the session, telling the server first when possible. Terminal.
    pub fn shutdown(&mut self) {
        if self.status == SyncStatus::Closed {
            return;
        }

        if let Some(session) = self.session.as_mut() {
            if session.is_connected() {
                let close = self.codec.encode_message(&Message::Close);
                if let Ok(payload) = close {
                    if let Err(err) = session.send_request(&payload) {
                        debug!(error = %err, "Server did not acknowledge close");
                    }
                }
            }
        }

        self.drop_session();
        self.set_status(SyncStatus::Closed);
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Publish attributes of an object; takes effect after a re-handshake
    pub fn publish(&mut self, declaration: ObjectDeclaration) -> Result<(), SyncError> {
        self.ensure_open()?;
        if let Some(pair) = handshake::overlap(&declaration, &self.receive) {
            return Err(SyncError::DeclarationConflict(format!(
                "{pair} is already subscribed"
            )));
        }
        if handshake::merge(&mut self.send, declaration) {
            self.declarations_changed = true;
        }
        Ok(())
    }

    /// Subscribe to attributes of an object; takes effect after a re-handshake
    pub fn subscribe(&mut self, declaration: ObjectDeclaration) -> Result<(), SyncError> {
        self.ensure_open()?;
        if let Some(pair) = handshake::overlap(&declaration, &self.send) {
            return Err(SyncError::DeclarationConflict(format!(
                "{pair} is already published"
            )));
        }
        if handshake::merge(&mut self.receive, declaration) {
            self.declarations_changed = true;
        }
        Ok(())
    }

    pub fn unpublish(&mut self, id: &str) -> Result<bool, SyncError> {
        self.ensure_open()?;
        let removed = handshake::remove(&mut self.send, id);
        self.declarations_changed |= removed;
        Ok(removed)
    }

    pub fn unsubscribe(&mut self, id: &str) -> Result<bool, SyncError> {
        self.ensure_open()?;
        let removed = handshake::remove(&mut self.receive, id);
        self.declarations_changed |= removed;
        Ok(removed)
    }

    /// Queue a simulation API call for the next successful exchange.
    ///
    /// Delivery is at least once: a call stays queued until an update comes
    /// back, so an exchange that times out or gets an unreadable reply sends
    /// it again even if the server already ran it. Only queue calls that are
    /// safe to repeat.
    pub fn queue_api_call(&mut self, call: ApiCall) {
        self.api_calls.push(call);
    }

    /// Results the server returned for earlier API calls
    pub fn take_api_results(&mut self) -> Vec<ApiCall> {
        std::mem::take(&mut self.api_results)
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    /// Most recent error, including ones that were recovered from
    pub fn last_error(&self) -> Option<&SyncError> {
        self.last_error.as_ref()
    }

    /// Host time accumulated from tick deltas, in seconds
    pub fn sim_time(&self) -> f64 {
        self.sim_time
    }

    /// Server time from the latest acknowledged handshake or update
    pub fn remote_sim_time(&self) -> Option<f64> {
        self.remote_sim_time
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session
            .as_ref()
            .map_or(ConnectionState::Disconnected, Session::state)
    }

    pub fn send_declarations(&self) -> &[ObjectDeclaration] {
        &self.send
    }

    pub fn receive_declarations(&self) -> &[ObjectDeclaration] {
        &self.receive
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.status == SyncStatus::Closed {
            Err(SyncError::InvalidState("closed"))
        } else {
            Ok(())
        }
    }

    fn set_status(&mut self, status: SyncStatus) {
        if self.status != status {
            info!(from = %self.status, to = %status, "Sync status changed");
            self.status = status;
        }
    }

    fn open_session(&mut self) -> Result<(), SyncError> {
        let session = Session::connect(
            &self.config.server_address,
            self.connector.as_ref(),
            self.config.session_options(),
        )?;
        self.shutdown.arm(Some(session.abort_handle()));
        self.session = Some(session);
        Ok(())
    }

    fn drop_session(&mut self) {
        self.shutdown.arm(None);
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    fn session_connected(&self) -> bool {
        self.session.as_ref().is_some_and(Session::is_connected)
    }

    /// Encode, exchange and decode one message
    fn request(&mut self, message: &Message) -> Result<Message, SyncError> {
        let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;
        let payload = self.codec.encode_message(message)?;
        debug!(message = message.name(), bytes = payload.len(), "Sending request");

        let response = session.send_request(&payload)?;
        self.codec.decode_message(&response).map_err(|err| match err {
            CodecError::UnsupportedVersion { expected, found } => {
                ConnectError::ProtocolMismatch { expected, found }.into()
            }
            other => other.into(),
        })
    }

    fn handshake<S>(&mut self, scene: &mut S) -> Result<(), SyncError>
    where
        S: SceneAdapter + ?Sized,
    {
        // Edits made while disconnected to already tracked objects outrank
        // the server's resume values; fresh objects take the resume as is.
        let tracked: BTreeSet<String> = self.cache.ids().map(str::to_string).collect();
        self.sync_registrations(&*scene);
        self.observe_scene(&*scene, Some(&tracked))?;

        let request = Message::Handshake(Handshake {
            client_id: self.client_id,
            meta: self.config.meta.clone(),
            send: self.send.clone(),
            receive: self.receive.clone(),
        });

        let ack = match self.request(&request)? {
            Message::HandshakeAck(ack) => ack,
            Message::Reset { reason } => return Err(SyncError::HandshakeMismatch(reason)),
            other => return Err(SyncError::UnexpectedMessage(other.name())),
        };
        handshake::verify_ack(&self.send, &self.receive, &ack)?;

        if !ack.resume.is_empty() {
            let batch = self.remote_batch(ack.resume, &self.send)?;
            let applied = self.cache.apply_remote(&batch)?;
            info!(objects = applied.len(), "Resuming server-held state");
            for state in &applied {
                scene.write_attributes(&state.id, state);
            }
        }

        self.remote_sim_time = Some(ack.sim_time);
        self.declarations_changed = false;
        self.attempts = 0;
        self.since_exchange = self.config.exchange_interval();
        info!(
            send = self.send.len(),
            receive = self.receive.len(),
            sim_time = ack.sim_time,
            "Handshake acknowledged"
        );
        self.set_status(SyncStatus::Synchronizing);
        Ok(())
    }

    fn exchange<S>(&mut self, scene: &mut S) -> Result<(), SyncError>
    where
        S: SceneAdapter + ?Sized,
    {
        self.sync_registrations(&*scene);
        self.observe_scene(&*scene, None)?;

        let request = Message::Exchange(Exchange {
            sim_time: self.sim_time,
            objects: self.cache.snapshot_dirty(),
            api_calls: self.api_calls.clone(),
        });

        let update = match self.request(&request)? {
            Message::Update(update) => update,
            Message::Reset { reason } => {
                warn!(reason = %reason, "Server reset the session");
                self.set_status(SyncStatus::Handshaking);
                return Ok(());
            }
            Message::Close => {
                if let Some(session) = self.session.as_mut() {
                    session.close();
                }
                return Err(TransportError::Closed.into());
            }
            other => return Err(SyncError::UnexpectedMessage(other.name())),
        };

        let batch = self.remote_batch(update.objects, &self.receive)?;
        let applied = self.cache.apply_remote(&batch)?;
        for state in &applied {
            scene.write_attributes(&state.id, state);
        }

        debug!(
            sent = request.objects().len(),
            received = batch.len(),
            applied = applied.len(),
            "Exchange complete"
        );

        self.cache.clear_dirty();
        self.api_calls.clear();
        self.api_results.extend(update.api_results);
        self.remote_sim_time = Some(update.sim_time);
        Ok(())
    }

    /// Track exactly the declared objects the scene currently lists
    fn sync_registrations<S>(&mut self, scene: &S)
    where
        S: SceneAdapter + ?Sized,
    {
        let listed: BTreeSet<String> = scene.list_synced_objects().into_iter().collect();

        let stale: Vec<String> = self
            .cache
            .ids()
            .filter(|id| {
                !listed.contains(*id)
                    || (handshake::find(&self.send, id).is_none()
                        && handshake::find(&self.receive, id).is_none())
            })
            .map(str::to_string)
            .collect();
        for id in stale {
            debug!(object = %id, "Unregistering object");
            self.cache.unregister(&id);
        }

        for declaration in self.send.iter().chain(&self.receive) {
            if listed.contains(&declaration.id)
                && self.cache.register(declaration.id.clone(), declaration.kind)
            {
                debug!(object = %declaration.id, "Registered object");
            }
        }
    }

    /// Mark published attributes the host changed since the last look,
    /// restricted to `only` when given
    fn observe_scene<S>(&mut self, scene: &S, only: Option<&BTreeSet<String>>) -> Result<(), SyncError>
    where
        S: SceneAdapter + ?Sized,
    {
        for declaration in &self.send {
            if !self.cache.contains(&declaration.id)
                || only.is_some_and(|ids| !ids.contains(&declaration.id))
            {
                continue;
            }
            let Some(current) = scene.read_attributes(&declaration.id) else {
                continue;
            };

            let mut published = ObjectState::new(declaration.id.clone(), declaration.kind);
            for name in &declaration.attributes {
                let Some(value) = current.get(name) else {
                    continue;
                };
                if let Err((expected, found)) = attribute::check(name, value) {
                    warn!(
                        object = %declaration.id,
                        attribute = %name,
                        %expected,
                        %found,
                        "Skipping local value of the wrong type"
                    );
                    continue;
                }
                published.set(name.clone(), value.clone());
            }
            self.cache.observe_local(&published)?;
        }
        Ok(())
    }

    /// Check remote states against `declarations` and flatten them.
    /// Objects the scene no longer lists are skipped.
    fn remote_batch(
        &self,
        states: Vec<ObjectState>,
        declarations: &[ObjectDeclaration],
    ) -> Result<RemoteBatch, SyncError> {
        let mut batch = RemoteBatch::new();

        for state in states {
            let Some(declaration) = handshake::find(declarations, &state.id) else {
                return Err(CodecError::MalformedMessage(format!(
                    "state for undeclared object '{}'",
                    state.id
                ))
                .into());
            };

            for (name, value) in &state.attributes {
                if !declaration.declares(name) {
                    return Err(CodecError::MalformedMessage(format!(
                        "state for undeclared attribute '{}.{}'",
                        state.id, name
                    ))
                    .into());
                }
                attribute::check(name, value).map_err(|(expected, found)| {
                    SyncError::InvalidAttribute {
                        object: state.id.clone(),
                        attribute: name.clone(),
                        expected: expected.as_str(),
                        found: found.as_str(),
                    }
                })?;
            }

            if !self.cache.contains(&state.id) {
                debug!(object = %state.id, "Skipping state for object not in scene");
                continue;
            }
            for (name, value) in state.attributes {
                batch.push(state.id.clone(), name, value);
            }
        }

        Ok(batch)
    }

    fn handle_failure(&mut self, err: SyncError) {
        if err.is_fatal() {
            self.fail(err);
            return;
        }

        if self.status == SyncStatus::Synchronizing {
            if err.is_message_level() {
                warn!(error = %err, "Discarding exchange");
                self.last_error = Some(err);
                return;
            }
            let timed_out = matches!(err, SyncError::Transport(TransportError::Timeout));
            if timed_out && self.session_connected() {
                debug!("Exchange timed out, keeping stale state");
                self.last_error = Some(err);
                return;
            }
        }

        self.enter_degraded(err);
    }

    fn enter_degraded(&mut self, err: SyncError) {
        warn!(error = %err, "Synchronization degraded");
        if !self.session_connected() {
            self.drop_session();
        }
        self.last_error = Some(err);
        self.attempts = 0;
        self.resume_pending = false;
        self.backoff = self.retry.delay_for(0);
        self.set_status(SyncStatus::Degraded);
    }

    fn fail(&mut self, err: SyncError) {
        error!(error = %err, "Synchronization failed");
        self.resume_pending = false;
        self.drop_session();
        self.last_error = Some(err);
        self.set_status(SyncStatus::Failed);
    }

    fn degraded_tick<S>(&mut self, scene: &mut S, delta: Duration)
    where
        S: SceneAdapter + ?Sized,
    {
        if self.backoff > delta {
            self.backoff -= delta;
            return;
        }
        self.backoff = Duration::ZERO;

        // One blocking step per tick: a reconnect now, its handshake next tick
        if !std::mem::take(&mut self.resume_pending) {
            if !self.retry.allows(self.attempts) {
                let last = self
                    .last_error
                    .as_ref()
                    .map_or_else(|| "unknown error".to_string(), ToString::to_string);
                self.fail(SyncError::RetriesExhausted {
                    attempts: self.attempts,
                    last,
                });
                return;
            }

            self.attempts += 1;
            info!(
                attempt = self.attempts,
                max_attempts = self.retry.max_attempts,
                "Attempting to resume synchronization"
            );

            if !self.session_connected() {
                self.drop_session();
                match self.open_session() {
                    Ok(()) => {
                        debug!(attempt = self.attempts, "Reconnected, handshake on next tick");
                        self.resume_pending = true;
                    }
                    Err(err) => self.resume_failed(err),
                }
                return;
            }
        }

        if let Err(err) = self.handshake(scene) {
            self.resume_failed(err);
        }
    }

    fn resume_failed(&mut self, err: SyncError) {
        if err.is_fatal() {
            self.fail(err);
            return;
        }
        debug!(error = %err, attempt = self.attempts, "Resume attempt failed");
        if !self.session_connected() {
            self.drop_session();
        }
        self.last_error = Some(err);
        self.backoff = self.retry.delay_for(self.attempts);
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("client_id", &self.client_id)
            .field("status", &self.status)
            .field("session", &self.session)
            .field("objects", &self.cache.len())
            .field("dirty", &self.cache.dirty_count())
            .finish()
    }
}
