use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::num::Wrapping;
#[cfg(unix)]
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc::{channel, Sender, UnboundedSender};
use tokio::sync::oneshot;

use system::{
    ConnectionId, DisconnectReason, Message, SessionMessage, UserEvent,
};

use crate::ban::{BanEntry, BanId, BanRegistry, EXPIRATION_FORMAT};
use crate::banlist_file::write_banlist_file;
use crate::config::ServerSettings;
use crate::connection::ConnectionEvent;
use crate::connection_tx_storage::{ConnectionTx, ConnectionTxStorage};
use crate::json_api::{pop_api_path, JsonApiMethod, JsonApiResult, JsonObject};
use crate::recording::recording_path;
use crate::session::{HostRequest, Outbox, Outgoing};
use crate::session_registry::{RegistryEvent, SessionRegistry};
use crate::snapshot::SnapshotProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenTarget {
    Address(SocketAddr),
    #[cfg(unix)]
    Inherited(RawFd),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerNotice {
    Status { users: usize, sessions: usize },
    /// The listening socket must be closed.
    StopAccepting,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot listen on {target:?}: {source}")]
    Bind {
        target: ListenTarget,
        #[source]
        source: std::io::Error,
    },
    #[error("server was already started")]
    AlreadyStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted(ConnectionId),
    Rejected(DisconnectReason),
}

#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    pub recording: Option<String>,
    pub auto_stop: bool,
}

/// The server process core. Everything runs on the caller's thread;
/// effects on connections are collected and drained with [`Server::take_outgoing`].
pub struct Server {
    state: LifecycleState,
    options: ServerOptions,
    settings: ServerSettings,
    registry: SessionRegistry,
    bans: Box<dyn BanRegistry + Send>,
    connection_id_source: Wrapping<ConnectionId>,
    connections: HashMap<ConnectionId, IpAddr>,
    outbox: Outbox,
    notices: Vec<ServerNotice>,
    bans_changed: bool,
}

impl Server {
    pub fn new(
        options: ServerOptions,
        settings: ServerSettings,
        bans: Box<dyn BanRegistry + Send>,
        snapshots: Arc<dyn SnapshotProvider>,
    ) -> Self {
        Self {
            state: LifecycleState::NotStarted,
            options,
            settings,
            registry: SessionRegistry::new(snapshots),
            bans,
            connection_id_source: Wrapping(0),
            connections: HashMap::new(),
            outbox: Outbox::new(),
            notices: Vec::new(),
            bans_changed: false,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SessionRegistry {
        &mut self.registry
    }

    /// Binds the listening socket. A failure leaves the server not started.
    pub fn start(&mut self, target: ListenTarget) -> Result<TcpListener, ServerError> {
        if self.state != LifecycleState::NotStarted {
            return Err(ServerError::AlreadyStarted);
        }
        let listener = match target {
            ListenTarget::Address(addr) => TcpListener::bind(addr),
            #[cfg(unix)]
            ListenTarget::Inherited(fd) => {
                use std::os::unix::io::FromRawFd;
                // The descriptor is handed over by the process supervisor and owned from here on.
                let listener = unsafe { TcpListener::from_raw_fd(fd) };
                listener.local_addr().map(|_| listener)
            }
        }
        .map_err(|source| ServerError::Bind { target, source })?;

        self.state = LifecycleState::Running;
        match listener.local_addr() {
            Ok(addr) => log::info!("Listening on {}", addr),
            Err(_) => log::info!("Listening on {:?}", target),
        }
        self.push_status();
        Ok(listener)
    }

    pub fn connect(&mut self, peer: IpAddr) -> Admission {
        if self.state != LifecycleState::Running {
            return Admission::Rejected(DisconnectReason::Shutdown);
        }
        if self.bans.is_address_banned(&peer) {
            log::info!("Rejected banned address {}", peer);
            return Admission::Rejected(DisconnectReason::Banned);
        }

        let id = match self.next_connection_id() {
            Some(id) => id,
            None => {
                log::warn!("Rejected {}: all connection ids are in use", peer);
                return Admission::Rejected(DisconnectReason::ServerFull);
            }
        };
        self.connections.insert(id, peer);
        log::info!("Accepted connection {} from {}", id, peer);
        self.push_status();
        Admission::Accepted(id)
    }

    fn next_connection_id(&mut self) -> Option<ConnectionId> {
        for _ in 0..=ConnectionId::MAX {
            self.connection_id_source += Wrapping(1);
            let id = self.connection_id_source.0;
            if !self.connections.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    pub fn handle_message(&mut self, from: ConnectionId, message: SessionMessage) {
        if !self.connections.contains_key(&from) {
            log::warn!("Message from unknown connection {}", from);
            return;
        }
        if self.state != LifecycleState::Running {
            log::debug!("Ignoring message from {} while shutting down", from);
            return;
        }

        let session_id = message.session_id;
        let result = match message.message {
            Message::Host {
                name,
                alias,
                width,
                height,
                user_limit,
                mode,
            } => {
                let request = HostRequest {
                    alias,
                    width,
                    height,
                    user_limit,
                    mode,
                };
                self.registry
                    .host(from, &name, request, &self.settings, &mut self.outbox)
                    .map(|_| ())
            }
            Message::UserInfo {
                event: UserEvent::Join,
                name,
                ..
            } => self
                .registry
                .join(from, session_id, &name, &mut self.outbox)
                .map(|_| ()),
            message => self.registry.route(
                from,
                SessionMessage::new(session_id, message),
                &mut self.outbox,
            ),
        };

        if let Err(code) = result {
            log::info!("Request from connection {} failed: {:?}", from, code);
            self.outbox
                .send(from, SessionMessage::new(session_id, Message::Error(code)));
        }
        self.process_events();
    }

    pub fn disconnect(&mut self, from: ConnectionId, reason: UserEvent) {
        if self.connections.remove(&from).is_none() {
            return;
        }
        log::info!("Connection {} closed: {:?}", from, reason);
        self.registry.depart(from, reason, &mut self.outbox);
        self.process_events();
    }

    /// Begins shutdown. Completion is signalled by [`ServerNotice::Stopped`].
    pub fn stop(&mut self) {
        if self.state != LifecycleState::Running {
            log::debug!("Stop requested in state {:?}", self.state);
            return;
        }
        log::info!("Stopping server");
        self.state = LifecycleState::Stopping;
        self.notices.push(ServerNotice::StopAccepting);

        self.registry.stop_all(&mut self.outbox);
        for (&id, _) in self.connections.iter() {
            if self.registry.location(id).is_none() {
                self.outbox.close(id, DisconnectReason::Shutdown);
            }
        }
        self.process_events();
    }

    fn process_events(&mut self) {
        let events = self.registry.take_events();
        let mut stop_requested = false;

        for event in &events {
            match *event {
                RegistryEvent::SessionCreated(id) => self.assign_recording(id),
                RegistryEvent::UserLoggedIn { session, user } => {
                    log::debug!("User {} logged in to session {}", user, session)
                }
                RegistryEvent::SessionEnded(_) | RegistryEvent::UserDeparted { .. } => {
                    stop_requested |= self.options.auto_stop
                        && self.state == LifecycleState::Running
                        && self.registry.session_count() == 0
                        && self.registry.total_users() == 0;
                }
            }
        }

        if !events.is_empty() {
            self.push_status();
        }
        if self.state == LifecycleState::Stopping && self.registry.total_users() == 0 {
            self.state = LifecycleState::Stopped;
            log::info!("Server stopped");
            self.notices.push(ServerNotice::Stopped);
        }
        if stop_requested {
            log::info!("No sessions left, stopping automatically");
            self.stop();
        }
    }

    fn assign_recording(&mut self, id: system::SessionId) {
        let pattern = match &self.options.recording {
            Some(pattern) => pattern,
            None => return,
        };
        if let Some(session) = self.registry.session_mut(id) {
            let path = recording_path(pattern, &session.id_string(), session.alias(), &Local::now());
            session.set_recording_file(path);
        }
    }

    fn push_status(&mut self) {
        let users = self.registry.total_users();
        let sessions = self.registry.session_count();
        log::info!("Status: {} users in {} sessions", users, sessions);
        self.notices.push(ServerNotice::Status { users, sessions });
    }

    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        self.outbox.drain()
    }

    pub fn take_notices(&mut self) -> Vec<ServerNotice> {
        std::mem::take(&mut self.notices)
    }

    /// Ban list contents, if they changed since the last call.
    pub fn take_banlist_changes(&mut self) -> Option<Vec<BanEntry>> {
        if std::mem::replace(&mut self.bans_changed, false) {
            Some(self.bans.list_bans())
        } else {
            None
        }
    }

    pub fn call_json_api(
        &mut self,
        method: JsonApiMethod,
        path: &[String],
        request: &JsonObject,
    ) -> JsonApiResult {
        let result = match pop_api_path(path) {
            (Some("server"), rest) if rest.is_empty() => self.server_api(method, request),
            (Some("sessions"), rest) => self.registry.call_sessions_api(
                method,
                rest,
                request,
                &self.settings,
                &mut self.outbox,
            ),
            (Some("banlist"), rest) => self.banlist_api(method, rest, request),
            _ => JsonApiResult::not_found(),
        };
        self.process_events();
        result
    }

    fn server_api(&mut self, method: JsonApiMethod, request: &JsonObject) -> JsonApiResult {
        match method {
            JsonApiMethod::Get => JsonApiResult::ok_from(&self.settings),
            JsonApiMethod::Update => match self.settings.update(request) {
                Ok(()) => {
                    log::info!("Server settings updated");
                    self.registry.allow_persistence(self.settings.persistence);
                    JsonApiResult::ok_from(&self.settings)
                }
                Err(err) => JsonApiResult::bad_request(&err.to_string()),
            },
            _ => JsonApiResult::bad_method(),
        }
    }

    fn banlist_api(
        &mut self,
        method: JsonApiMethod,
        path: &[String],
        request: &JsonObject,
    ) -> JsonApiResult {
        match (method, pop_api_path(path)) {
            (JsonApiMethod::Get, (None, _)) => JsonApiResult::ok_from(&self.bans.list_bans()),
            (JsonApiMethod::Create, (None, _)) => match parse_ban(request) {
                Ok((ip, subnet, expiration, comment)) => {
                    let entry = self.bans.add_ban(ip, subnet, expiration, comment);
                    self.bans_changed = true;
                    JsonApiResult::ok_from(&entry)
                }
                Err(message) => JsonApiResult::bad_request(message),
            },
            (JsonApiMethod::Delete, (Some(id), rest)) if rest.is_empty() => {
                match id.parse::<BanId>() {
                    Ok(id) if self.bans.delete_ban(id) => {
                        self.bans_changed = true;
                        JsonApiResult::ok(json!({ "status": "ok" }))
                    }
                    _ => JsonApiResult::not_found(),
                }
            }
            // a single entry can only be deleted
            (_, (Some(_), rest)) if rest.is_empty() => JsonApiResult::bad_method(),
            (_, (None, _)) => JsonApiResult::bad_method(),
            _ => JsonApiResult::not_found(),
        }
    }
}

fn parse_ban(request: &JsonObject) -> Result<(IpAddr, u8, NaiveDateTime, String), &'static str> {
    let ip: IpAddr = request
        .get("ip")
        .and_then(Value::as_str)
        .and_then(|ip| ip.parse().ok())
        .ok_or("invalid IP address")?;
    let max_subnet = if ip.is_ipv4() { 32 } else { 128 };
    let subnet = request
        .get("subnet")
        .and_then(Value::as_u64)
        .filter(|&subnet| subnet <= max_subnet)
        .ok_or("invalid subnet size")? as u8;
    let expiration = request
        .get("expiration")
        .and_then(Value::as_str)
        .and_then(|s| NaiveDateTime::parse_from_str(s, EXPIRATION_FORMAT).ok())
        .ok_or("invalid expiration time")?;
    let comment = request
        .get("comment")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    Ok((ip, subnet, expiration, comment))
}

#[derive(Debug)]
pub enum ServerCommand {
    Connect {
        tx: ConnectionTx,
        peer: IpAddr,
    },
    Disconnect {
        from: ConnectionId,
        reason: UserEvent,
    },
    Message {
        from: ConnectionId,
        message: SessionMessage,
    },
    Admin {
        method: JsonApiMethod,
        path: Vec<String>,
        request: JsonObject,
        tx: oneshot::Sender<JsonApiResult>,
    },
    Stop,
}

pub type ServerTx = Sender<ServerCommand>;

struct ServerLoop {
    server: Server,
    connections: ConnectionTxStorage,
    notices: UnboundedSender<ServerNotice>,
    banlist_file: Option<PathBuf>,
}

impl ServerLoop {
    async fn handle_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::Connect { tx, peer } => match self.server.connect(peer) {
                Admission::Accepted(connection_id) => {
                    self.connections.insert(connection_id, tx);
                    let client_timeout = self.server.settings().client_timeout();
                    self.connections
                        .send(
                            &connection_id,
                            ConnectionEvent::Connected {
                                connection_id,
                                client_timeout,
                            },
                        )
                        .await;
                }
                Admission::Rejected(reason) => {
                    if tx.send(ConnectionEvent::Disconnected { reason }).await.is_err() {
                        log::debug!("Rejected client {} is already gone", peer);
                    }
                }
            },
            ServerCommand::Disconnect { from, reason } => {
                self.connections.remove(&from);
                self.server.disconnect(from, reason);
            }
            ServerCommand::Message { from, message } => self.server.handle_message(from, message),
            ServerCommand::Admin {
                method,
                path,
                request,
                tx,
            } => {
                let result = self.server.call_json_api(method, &path, &request);
                if tx.send(result).is_err() {
                    log::warn!("Admin request was abandoned");
                }
            }
            ServerCommand::Stop => self.server.stop(),
        }
        self.flush().await;
    }

    async fn flush(&mut self) {
        for outgoing in self.server.take_outgoing() {
            match outgoing {
                Outgoing::Send { to, message } => {
                    self.connections
                        .send(&to, ConnectionEvent::Message(message))
                        .await
                }
                Outgoing::Close { to, reason } => {
                    self.connections
                        .send(&to, ConnectionEvent::Disconnected { reason })
                        .await
                }
            }
        }

        for notice in self.server.take_notices() {
            if self.notices.send(notice).is_err() {
                log::debug!("Nobody is listening for server notices");
            }
        }

        if let Some(entries) = self.server.take_banlist_changes() {
            if let Some(path) = &self.banlist_file {
                if let Err(err) = write_banlist_file(path, &entries).await {
                    log::error!("Cannot save ban list to {}: {}", path.display(), err);
                }
            }
        }
    }
}

/// Runs `server` on its own task. It must already be started.
pub fn spawn_server(
    server: Server,
    banlist_file: Option<PathBuf>,
    notices: UnboundedSender<ServerNotice>,
) -> ServerTx {
    let (srv_tx, mut srv_rx) = channel::<ServerCommand>(1024);

    tokio::spawn(async move {
        let mut server = Box::new(ServerLoop {
            server,
            connections: ConnectionTxStorage::new(),
            notices,
            banlist_file,
        });
        server.flush().await;

        while let Some(command) = srv_rx.recv().await {
            server.handle_command(command).await;
        }
    });

    srv_tx
}
