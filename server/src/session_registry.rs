use std::collections::{BTreeMap, HashMap};
use std::num::Wrapping;
use std::sync::Arc;

use serde_json::{json, Value};
use system::{ConnectionId, ErrorCode, Message, SessionId, SessionMessage, UserEvent, UserId};

use crate::config::ServerSettings;
use crate::json_api::{pop_api_path, JsonApiMethod, JsonApiResult, JsonObject};
use crate::session::{HostRequest, Outbox, Session};
use crate::snapshot::SnapshotProvider;

/// State changes the server's lifecycle evaluator reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    SessionCreated(SessionId),
    SessionEnded(SessionId),
    UserLoggedIn {
        session: SessionId,
        user: UserId,
    },
    UserDeparted {
        session: SessionId,
        user: UserId,
        reason: UserEvent,
    },
}

pub struct SessionRegistry {
    session_id_source: Wrapping<SessionId>,
    sessions: BTreeMap<SessionId, Session>,
    connection_locations: HashMap<ConnectionId, (SessionId, UserId)>,
    snapshots: Arc<dyn SnapshotProvider>,
    chunk_size: Option<usize>,
    events: Vec<RegistryEvent>,
}

impl SessionRegistry {
    pub fn new(snapshots: Arc<dyn SnapshotProvider>) -> Self {
        Self {
            session_id_source: Wrapping(0),
            sessions: BTreeMap::new(),
            connection_locations: HashMap::new(),
            snapshots,
            chunk_size: None,
            events: Vec::new(),
        }
    }

    /// Applies a change of the server's persistence setting to every session.
    pub fn allow_persistence(&mut self, allowed: bool) {
        for session in self.sessions.values_mut() {
            session.allow_persistence(allowed);
        }
    }

    /// Raster chunk size for sessions created from now on.
    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = Some(chunk_size);
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn find_session(&self, id_or_alias: &str) -> Option<&Session> {
        if let Ok(id) = id_or_alias.parse::<SessionId>() {
            if let Some(session) = self.sessions.get(&id) {
                return Some(session);
            }
        }
        self.sessions
            .values()
            .find(|s| s.alias() == Some(id_or_alias))
    }

    pub fn location(&self, connection: ConnectionId) -> Option<(SessionId, UserId)> {
        self.connection_locations.get(&connection).copied()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn total_users(&self) -> usize {
        self.sessions.values().map(Session::user_count).sum()
    }

    pub fn take_events(&mut self) -> Vec<RegistryEvent> {
        std::mem::take(&mut self.events)
    }

    /// Creates a session and joins `connection` to it as its owner.
    pub fn host(
        &mut self,
        connection: ConnectionId,
        name: &str,
        mut request: HostRequest,
        settings: &ServerSettings,
        out: &mut Outbox,
    ) -> Result<(SessionId, UserId), ErrorCode> {
        if self.connection_locations.contains_key(&connection) {
            return Err(ErrorCode::AlreadyInSession);
        }
        if settings.session_count_limit > 0 && self.sessions.len() >= settings.session_count_limit {
            log::warn!("Session limit of {} reached", settings.session_count_limit);
            return Err(ErrorCode::TooManySessions);
        }
        if let Some(alias) = request.alias.as_deref() {
            if self.sessions.values().any(|s| s.alias() == Some(alias)) {
                return Err(ErrorCode::AliasTaken);
            }
        }
        request.alias = request.alias.filter(|a| !a.is_empty());
        if request.mode.persistent && !settings.persistence {
            log::debug!("Persistence disabled, hosting a regular session");
            request.mode.persistent = false;
        }

        let session_id = self.new_session_id();
        let mut session = Session::new(session_id, request, self.snapshots.clone());
        session.allow_persistence(settings.persistence);
        if let Some(chunk_size) = self.chunk_size {
            session.set_chunk_size(chunk_size);
        }
        self.sessions.insert(session_id, session);
        self.events.push(RegistryEvent::SessionCreated(session_id));
        log::info!("Session {} created", session_id);

        let user = self.join(connection, session_id, name, out)?;
        Ok((session_id, user))
    }

    pub fn join(
        &mut self,
        connection: ConnectionId,
        session_id: SessionId,
        name: &str,
        out: &mut Outbox,
    ) -> Result<UserId, ErrorCode> {
        if self.connection_locations.contains_key(&connection) {
            return Err(ErrorCode::AlreadyInSession);
        }
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(ErrorCode::NoSuchSession)?;
        let user = session.join(connection, name, out)?;
        self.connection_locations
            .insert(connection, (session_id, user));
        self.events.push(RegistryEvent::UserLoggedIn {
            session: session_id,
            user,
        });
        Ok(user)
    }

    /// Hands a message from a member to its session.
    pub fn route(
        &mut self,
        connection: ConnectionId,
        message: SessionMessage,
        out: &mut Outbox,
    ) -> Result<(), ErrorCode> {
        let (session_id, user) = self
            .location(connection)
            .ok_or(ErrorCode::NotInSession)?;
        if message.session_id != session_id {
            log::warn!(
                "Connection {} sent a message for session {} while in session {}",
                connection,
                message.session_id,
                session_id
            );
            return Ok(());
        }

        if let Message::UserInfo {
            event: UserEvent::Leave,
            ..
        } = message.message
        {
            self.depart(connection, UserEvent::Leave, out);
            return Ok(());
        }

        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.handle_message(user, message.message, out);
        }
        Ok(())
    }

    /// Removes the user behind `connection` from its session, if any.
    pub fn depart(
        &mut self,
        connection: ConnectionId,
        reason: UserEvent,
        out: &mut Outbox,
    ) -> Option<UserEvent> {
        let (session_id, user) = self.connection_locations.remove(&connection)?;
        let reason = self
            .sessions
            .get_mut(&session_id)
            .and_then(|session| session.remove_user(user, reason, out))?;
        self.events.push(RegistryEvent::UserDeparted {
            session: session_id,
            user,
            reason,
        });
        self.reap(session_id);
        Some(reason)
    }

    pub fn terminate(&mut self, session_id: SessionId, out: &mut Outbox) -> bool {
        match self.sessions.get_mut(&session_id) {
            Some(session) => session.terminate(out),
            None => return false,
        }
        self.reap(session_id);
        true
    }

    pub fn stop_all(&mut self, out: &mut Outbox) {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.terminate(id, out);
        }
    }

    fn reap(&mut self, session_id: SessionId) {
        let closing = self
            .sessions
            .get(&session_id)
            .map(Session::should_close)
            .unwrap_or(false);
        if closing {
            self.sessions.remove(&session_id);
            self.events.push(RegistryEvent::SessionEnded(session_id));
            log::info!("Session {} ended", session_id);
        }
    }

    fn new_session_id(&mut self) -> SessionId {
        loop {
            self.session_id_source += Wrapping(1);
            let id = self.session_id_source.0;
            if id != 0 && !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn call_sessions_api(
        &mut self,
        method: JsonApiMethod,
        path: &[String],
        request: &JsonObject,
        settings: &ServerSettings,
        out: &mut Outbox,
    ) -> JsonApiResult {
        let (head, rest) = pop_api_path(path);
        let head = match head {
            None if method == JsonApiMethod::Get => {
                let list: Vec<Value> = self.sessions.values().map(session_summary).collect();
                return JsonApiResult::ok(Value::Array(list));
            }
            None => return JsonApiResult::bad_method(),
            Some(head) => head,
        };
        let session_id = match self.find_session(head) {
            Some(session) => session.id(),
            None => return JsonApiResult::not_found(),
        };

        match (method, pop_api_path(rest)) {
            (JsonApiMethod::Get, (None, _)) => match self.sessions.get(&session_id) {
                Some(session) => JsonApiResult::ok(session_details(session, settings)),
                None => JsonApiResult::not_found(),
            },
            (JsonApiMethod::Update, (None, _)) => {
                self.update_session(session_id, request, settings, out)
            }
            (JsonApiMethod::Delete, (None, _)) => {
                self.terminate(session_id, out);
                JsonApiResult::ok(json!({ "status": "ok" }))
            }
            (JsonApiMethod::Delete, (Some(user), rest)) if rest.is_empty() => {
                let kicked = match (user.parse::<UserId>(), self.sessions.get_mut(&session_id)) {
                    (Ok(user), Some(session)) => session.kick(user, out),
                    _ => false,
                };
                if kicked {
                    JsonApiResult::ok(json!({ "status": "ok" }))
                } else {
                    JsonApiResult::not_found()
                }
            }
            (_, (None, _)) => JsonApiResult::bad_method(),
            _ => JsonApiResult::not_found(),
        }
    }

    fn update_session(
        &mut self,
        session_id: SessionId,
        request: &JsonObject,
        settings: &ServerSettings,
        out: &mut Outbox,
    ) -> JsonApiResult {
        let session = match self.sessions.get_mut(&session_id) {
            Some(session) => session,
            None => return JsonApiResult::not_found(),
        };

        let user_limit = match request.get("userLimit") {
            None => None,
            Some(value) => match value.as_u64() {
                Some(limit) => Some(limit.min(u64::from(u8::MAX)) as u8),
                None => return JsonApiResult::bad_request("userLimit must be a number"),
            },
        };
        let locked = match request.get("locked") {
            None => None,
            Some(value) => match value.as_bool() {
                Some(locked) => Some(locked),
                None => return JsonApiResult::bad_request("locked must be a boolean"),
            },
        };
        let persistent = match request.get("persistent") {
            None => None,
            Some(value) => match value.as_bool() {
                Some(true) if !settings.persistence => {
                    return JsonApiResult::bad_request("persistence is not enabled")
                }
                Some(persistent) => Some(persistent),
                None => return JsonApiResult::bad_request("persistent must be a boolean"),
            },
        };

        if user_limit.is_some() || persistent.is_some() {
            let info = session.info();
            let mut mode = info.mode;
            if let Some(persistent) = persistent {
                mode.persistent = persistent;
            }
            session.alter(
                info.width,
                info.height,
                user_limit.unwrap_or(info.user_limit),
                mode,
                out,
            );
        }
        if let Some(locked) = locked {
            session.set_locked(None, locked, out);
        }

        let details = session_details(session, settings);
        self.reap(session_id);
        JsonApiResult::ok(details)
    }
}

fn session_summary(session: &Session) -> Value {
    let info = session.info();
    json!({
        "id": info.id,
        "alias": info.alias,
        "owner": info.owner,
        "width": info.width,
        "height": info.height,
        "userCount": session.user_count(),
        "maxUsers": info.user_limit,
        "locked": info.mode.locked,
        "persistent": info.mode.persistent,
        "closing": session.is_terminating(),
    })
}

fn session_details(session: &Session, settings: &ServerSettings) -> Value {
    let mut details = session_summary(session);
    let users: Vec<Value> = session
        .users()
        .map(|user| {
            if settings.private_user_list {
                json!({ "id": user.id, "locked": user.locked })
            } else {
                json!({ "id": user.id, "name": user.name, "locked": user.locked })
            }
        })
        .collect();
    if let Value::Object(ref mut fields) = details {
        fields.insert("users".into(), Value::Array(users));
        fields.insert(
            "recording".into(),
            json!(session.recording_file().map(|p| p.display().to_string())),
        );
    }
    details
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_api::JsonApiStatus;
    use crate::session::Outgoing;
    use crate::snapshot::BlankCanvas;
    use system::{DisconnectReason, SessionMode};

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(BlankCanvas))
    }

    fn request(alias: Option<&str>) -> HostRequest {
        HostRequest {
            alias: alias.map(str::to_owned),
            width: 64,
            height: 64,
            user_limit: 8,
            mode: SessionMode::default(),
        }
    }

    fn body(value: Value) -> JsonObject {
        match value {
            Value::Object(map) => map,
            _ => JsonObject::new(),
        }
    }

    #[test]
    fn it_hosts_and_ends_sessions() {
        let mut registry = registry();
        let mut out = Outbox::new();
        let settings = ServerSettings::default();

        let (session, owner) = registry
            .host(1, "alice", request(Some("party")), &settings, &mut out)
            .unwrap();
        assert_eq!(registry.session(session).unwrap().owner(), owner);
        assert_eq!(registry.find_session("party").unwrap().id(), session);
        assert_eq!(
            registry.join(2, session, "bob", &mut out),
            Ok(2)
        );
        assert_eq!(registry.total_users(), 2);

        registry.depart(1, UserEvent::Disconnect, &mut out);
        registry.depart(2, UserEvent::TimedOut, &mut out);
        assert_eq!(registry.session_count(), 0);
        assert_eq!(
            registry.take_events(),
            vec![
                RegistryEvent::SessionCreated(session),
                RegistryEvent::UserLoggedIn { session, user: 1 },
                RegistryEvent::UserLoggedIn { session, user: 2 },
                RegistryEvent::UserDeparted {
                    session,
                    user: 1,
                    reason: UserEvent::Disconnect
                },
                RegistryEvent::UserDeparted {
                    session,
                    user: 2,
                    reason: UserEvent::TimedOut
                },
                RegistryEvent::SessionEnded(session),
            ]
        );
    }

    #[test]
    fn it_enforces_limits_and_aliases() {
        let mut registry = registry();
        let mut out = Outbox::new();
        let settings = ServerSettings {
            session_count_limit: 1,
            ..ServerSettings::default()
        };
        registry
            .host(1, "alice", request(Some("party")), &settings, &mut out)
            .unwrap();
        assert_eq!(
            registry.host(1, "alice", request(None), &settings, &mut out),
            Err(ErrorCode::AlreadyInSession)
        );
        assert_eq!(
            registry.host(2, "bob", request(None), &settings, &mut out),
            Err(ErrorCode::TooManySessions)
        );

        let settings = ServerSettings::default();
        assert_eq!(
            registry.host(2, "bob", request(Some("party")), &settings, &mut out),
            Err(ErrorCode::AliasTaken)
        );
        assert_eq!(
            registry.join(2, 999, "bob", &mut out),
            Err(ErrorCode::NoSuchSession)
        );
    }

    #[test]
    fn persistent_sessions_survive_until_terminated() {
        let mut registry = registry();
        let mut out = Outbox::new();
        let settings = ServerSettings {
            persistence: true,
            ..ServerSettings::default()
        };
        let mut persistent = request(None);
        persistent.mode.persistent = true;
        let (session, _) = registry
            .host(1, "alice", persistent, &settings, &mut out)
            .unwrap();

        registry.depart(1, UserEvent::Leave, &mut out);
        assert_eq!(registry.session_count(), 1);

        registry.stop_all(&mut out);
        assert_eq!(registry.session_count(), 0);
        assert!(registry
            .take_events()
            .contains(&RegistryEvent::SessionEnded(session)));
    }

    #[test]
    fn leave_message_departs_but_keeps_connection() {
        let mut registry = registry();
        let mut out = Outbox::new();
        let (session, user) = registry
            .host(1, "alice", request(None), &ServerSettings::default(), &mut out)
            .unwrap();
        let leave = SessionMessage::new(
            session,
            Message::UserInfo {
                event: UserEvent::Leave,
                user,
                name: "alice".into(),
                locked: false,
            },
        );
        registry.route(1, leave.clone(), &mut out).unwrap();
        assert_eq!(registry.location(1), None);
        assert_eq!(registry.route(1, leave, &mut out), Err(ErrorCode::NotInSession));
    }

    #[test]
    fn sessions_api_lists_updates_and_kicks() {
        let mut registry = registry();
        let mut out = Outbox::new();
        let settings = ServerSettings {
            private_user_list: true,
            ..ServerSettings::default()
        };
        let (session, _) = registry
            .host(1, "alice", request(Some("party")), &settings, &mut out)
            .unwrap();
        registry.join(2, session, "bob", &mut out).unwrap();
        out.drain();

        let list = registry.call_sessions_api(JsonApiMethod::Get, &[], &JsonObject::new(), &settings, &mut out);
        assert_eq!(list.body[0]["userCount"], 2);

        let path = vec!["party".to_string()];
        let details = registry.call_sessions_api(JsonApiMethod::Get, &path, &JsonObject::new(), &settings, &mut out);
        assert_eq!(details.body["users"][1]["id"], 2);
        assert!(details.body["users"][1].get("name").is_none());

        let updated = registry.call_sessions_api(
            JsonApiMethod::Update,
            &path,
            &body(json!({ "userLimit": 3, "locked": true })),
            &settings,
            &mut out,
        );
        assert_eq!(updated.status, JsonApiStatus::Ok);
        assert_eq!(updated.body["maxUsers"], 3);
        assert_eq!(updated.body["locked"], true);

        let bad = registry.call_sessions_api(
            JsonApiMethod::Update,
            &path,
            &body(json!({ "locked": "yes" })),
            &settings,
            &mut out,
        );
        assert_eq!(bad.status, JsonApiStatus::BadRequest);

        out.drain();
        let kick_path = vec![session.to_string(), "2".to_string()];
        let kicked = registry.call_sessions_api(JsonApiMethod::Delete, &kick_path, &JsonObject::new(), &settings, &mut out);
        assert_eq!(kicked.status, JsonApiStatus::Ok);
        assert!(out.drain().contains(&Outgoing::Close {
            to: 2,
            reason: DisconnectReason::Kicked
        }));

        let missing = vec![session.to_string(), "42".to_string()];
        let result = registry.call_sessions_api(JsonApiMethod::Delete, &missing, &JsonObject::new(), &settings, &mut out);
        assert_eq!(result.status, JsonApiStatus::NotFound);

        let result = registry.call_sessions_api(JsonApiMethod::Create, &path, &JsonObject::new(), &settings, &mut out);
        assert_eq!(result.status, JsonApiStatus::BadMethod);
    }
}
