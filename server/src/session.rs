use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use system::{
    AdminCommand, ConnectionId, DisconnectReason, DrawOperation, ErrorCode, Message, MessageKind,
    Raster, RasterBuffer, RasterProgress, RasterTransfer, SessionAction, SessionId, SessionInfo,
    SessionMessage, SessionMode, UserEvent, UserId, RASTER_CHUNK_SIZE,
};

use crate::snapshot::SnapshotProvider;

/// Something the server must do to a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Send {
        to: ConnectionId,
        message: SessionMessage,
    },
    Close {
        to: ConnectionId,
        reason: DisconnectReason,
    },
}

#[derive(Debug, Default)]
pub struct Outbox {
    items: Vec<Outgoing>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, to: ConnectionId, message: SessionMessage) {
        self.items.push(Outgoing::Send { to, message });
    }

    pub fn close(&mut self, to: ConnectionId, reason: DisconnectReason) {
        self.items.push(Outgoing::Close { to, reason });
    }

    pub fn drain(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.items)
    }
}

/// Parameters of a session, as requested by its host.
#[derive(Debug, Clone)]
pub struct HostRequest {
    pub alias: Option<String>,
    pub width: u16,
    pub height: u16,
    pub user_limit: u8,
    pub mode: SessionMode,
}

#[derive(Debug)]
enum SyncPhase {
    /// Joined, waiting for the session to reach a consistent point.
    AwaitingSnapshot,
    /// Captured, while a member uploads the canvas. Already gets live drawing.
    AwaitingUpload,
    /// Receiving the snapshot. Already gets live drawing.
    Receiving(RasterTransfer),
    Synced,
}

/// Canvas being collected from a member.
#[derive(Debug)]
struct Upload {
    from: UserId,
    buffer: RasterBuffer,
    /// Drawing was broadcast since the capture, so the upload cannot be
    /// requested again from someone else.
    dirty: bool,
}

#[derive(Debug)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub locked: bool,
    pub connection: ConnectionId,
    phase: SyncPhase,
}

impl User {
    fn gets_drawing(&self) -> bool {
        !matches!(self.phase, SyncPhase::AwaitingSnapshot)
    }

    fn is_synced(&self) -> bool {
        matches!(self.phase, SyncPhase::Synced)
    }
}

pub struct Session {
    id: SessionId,
    alias: Option<String>,
    owner: UserId,
    width: u16,
    height: u16,
    user_limit: u8,
    mode: SessionMode,
    recording_file: Option<PathBuf>,
    users: BTreeMap<UserId, User>,
    last_user_id: UserId,
    awaiting_idle: BTreeSet<UserId>,
    idle: BTreeSet<UserId>,
    departure_reasons: HashMap<UserId, UserEvent>,
    terminating: bool,
    persistence_allowed: bool,
    snapshots: Arc<dyn SnapshotProvider>,
    upload: Option<Upload>,
    chunk_size: usize,
}

impl Session {
    pub fn new(id: SessionId, request: HostRequest, snapshots: Arc<dyn SnapshotProvider>) -> Self {
        Self {
            id,
            alias: request.alias,
            owner: 0,
            width: request.width,
            height: request.height,
            user_limit: request.user_limit.max(1),
            mode: request.mode,
            recording_file: None,
            users: BTreeMap::new(),
            last_user_id: 0,
            awaiting_idle: BTreeSet::new(),
            idle: BTreeSet::new(),
            departure_reasons: HashMap::new(),
            terminating: false,
            persistence_allowed: false,
            snapshots,
            upload: None,
            chunk_size: RASTER_CHUNK_SIZE,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn id_string(&self) -> String {
        self.id.to_string()
    }

    pub fn owner(&self) -> UserId {
        self.owner
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            alias: self.alias.clone(),
            owner: self.owner,
            width: self.width,
            height: self.height,
            user_limit: self.user_limit,
            mode: self.mode,
        }
    }

    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating
    }

    /// Empty and nothing keeps it around.
    pub fn should_close(&self) -> bool {
        self.users.is_empty() && (self.terminating || !self.mode.persistent)
    }

    pub fn recording_file(&self) -> Option<&Path> {
        self.recording_file.as_deref()
    }

    pub fn set_recording_file(&mut self, path: PathBuf) {
        log::info!("Session {} will be recorded to {}", self.id, path.display());
        self.recording_file = Some(path);
    }

    /// Whether members may make the session persistent. Without it an owner
    /// can clear the flag but not set it.
    pub fn allow_persistence(&mut self, allowed: bool) {
        self.persistence_allowed = allowed;
    }

    /// Size of the raster chunks sent to joining users.
    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size.max(1);
    }

    pub fn join(
        &mut self,
        connection: ConnectionId,
        name: &str,
        out: &mut Outbox,
    ) -> Result<UserId, ErrorCode> {
        if self.terminating {
            return Err(ErrorCode::NoSuchSession);
        }
        if self.users.len() >= usize::from(self.user_limit) {
            return Err(ErrorCode::SessionFull);
        }

        self.last_user_id += 1;
        let id = self.last_user_id;
        if self.users.is_empty() {
            self.owner = id;
        }

        out.send(
            connection,
            self.wrap(Message::Joined {
                user: id,
                session: self.info(),
            }),
        );
        for user in self.users.values() {
            out.send(
                connection,
                self.wrap(Message::UserInfo {
                    event: UserEvent::Join,
                    user: user.id,
                    name: user.name.clone(),
                    locked: user.locked,
                }),
            );
        }

        self.users.insert(
            id,
            User {
                id,
                name: name.to_owned(),
                locked: false,
                connection,
                phase: SyncPhase::AwaitingSnapshot,
            },
        );
        self.broadcast(
            Message::UserInfo {
                event: UserEvent::Join,
                user: id,
                name: name.to_owned(),
                locked: false,
            },
            out,
        );
        log::info!("User {} ({}) joined session {}", id, name, self.id);

        let to_pause: Vec<(UserId, ConnectionId)> = self
            .users
            .values()
            .filter(|u| u.is_synced())
            .filter(|u| !self.awaiting_idle.contains(&u.id) && !self.idle.contains(&u.id))
            .map(|u| (u.id, u.connection))
            .collect();
        for (user, connection) in to_pause {
            self.awaiting_idle.insert(user);
            out.send(connection, self.wrap(Message::Synchronize));
        }
        self.try_capture(out);

        Ok(id)
    }

    pub fn handle_message(&mut self, from: UserId, message: Message, out: &mut Outbox) {
        let message = match message.into_draw_operation() {
            Ok(op) => return self.handle_draw_operation(from, op, out),
            Err(message) => message,
        };

        match message {
            Message::Chat { data, .. } => self.broadcast(Message::Chat { user: from, data }, out),
            Message::Raster(chunk) => self.handle_upload(from, &chunk, out),
            Message::Acknowledgement { event } => self.handle_ack(from, event, out),
            Message::SessionSelect => self.send_to(
                from,
                Message::Acknowledgement {
                    event: MessageKind::SessionSelect,
                },
                out,
            ),
            Message::SessionEvent { action, target } => {
                if !self.check_owner(from, "session event") {
                    return;
                }
                let applied = match (action, target) {
                    (SessionAction::Lock, target) => self.set_locked(target, true, out),
                    (SessionAction::Unlock, target) => self.set_locked(target, false, out),
                    (SessionAction::Kick, Some(target)) => self.kick(target, out),
                    (SessionAction::Delegate, Some(target)) => self.delegate(target, out),
                    (action, None) => {
                        log::warn!("Session event {:?} without target user", action);
                        true
                    }
                };
                if !applied {
                    log::warn!(
                        "Session event {:?} for user {:?} not in session {}",
                        action,
                        target,
                        self.id
                    );
                }
            }
            Message::Instruction {
                command,
                width,
                height,
                user_limit,
                mode,
            } => {
                if !self.check_owner(from, "instruction") {
                    return;
                }
                match command {
                    AdminCommand::Alter => {
                        self.alter(width, height, user_limit, mode, out);
                    }
                    AdminCommand::Destroy => self.terminate(out),
                }
            }
            other => log::warn!(
                "Unhandled {:?} message from user {} in session {}",
                other.kind(),
                from,
                self.id
            ),
        }
    }

    fn check_owner(&self, user: UserId, what: &str) -> bool {
        if user != self.owner {
            log::warn!(
                "User {} tried to send {} in session {} without owning it",
                user,
                what,
                self.id
            );
            return false;
        }
        true
    }

    fn handle_draw_operation(&mut self, from: UserId, op: DrawOperation, out: &mut Outbox) {
        let user = match self.users.get(&from) {
            Some(user) => user,
            None => return,
        };
        if !user.is_synced() {
            log::debug!("Dropping drawing from user {} who is still catching up", from);
            return;
        }
        if user.locked || (self.mode.locked && from != self.owner) {
            log::debug!("Dropping drawing from locked user {}", from);
            return;
        }

        let message = op.with_user(from).into_message();
        for user in self.users.values().filter(|u| u.gets_drawing()) {
            out.send(user.connection, self.wrap(message.clone()));
        }
        if let Some(upload) = self.upload.as_mut() {
            upload.dirty = true;
        }
    }

    fn handle_ack(&mut self, from: UserId, event: MessageKind, out: &mut Outbox) {
        match event {
            MessageKind::SyncWait => {
                if self.awaiting_idle.remove(&from) {
                    self.idle.insert(from);
                    self.try_capture(out);
                } else {
                    log::warn!("Unexpected sync acknowledgement from user {}", from);
                }
            }
            MessageKind::Raster => self.send_next_chunk(from, out),
            other => log::debug!("Unhandled acknowledgement {:?} from user {}", other, from),
        }
    }

    /// Joiners waiting for a capture, or for an upload when `upload` is set,
    /// that are not on their way out.
    fn joiners(&self, upload: bool) -> Vec<UserId> {
        self.users
            .values()
            .filter(|u| match u.phase {
                SyncPhase::AwaitingSnapshot => !upload,
                SyncPhase::AwaitingUpload => upload,
                _ => false,
            })
            .filter(|u| !self.departure_reasons.contains_key(&u.id))
            .map(|u| u.id)
            .collect()
    }

    /// Captures the snapshot for waiting joiners once every member asked to
    /// pause has done so, then lets the paused members continue. When the
    /// canvas has to be uploaded by a member, the paused members wait for the
    /// upload as well.
    fn try_capture(&mut self, out: &mut Outbox) {
        if self.upload.is_some() {
            if !self.joiners(true).is_empty() {
                return;
            }
            log::debug!("Nobody waits for the upload in session {} any more", self.id);
            self.upload = None;
        }

        let joiners = self.joiners(false);
        if !joiners.is_empty() {
            if !self.awaiting_idle.is_empty() {
                return;
            }

            match self.snapshots.current_snapshot(self.id) {
                Some(snapshot) => self.start_transfers(&joiners, snapshot, out),
                None => match self.pick_uploader() {
                    Some(uploader) => {
                        self.request_upload(uploader, &joiners, out);
                        return;
                    }
                    None => self.start_transfers(&joiners, Vec::new(), out),
                },
            }
        }

        for id in std::mem::take(&mut self.idle) {
            self.send_to(
                id,
                Message::Acknowledgement {
                    event: MessageKind::SyncWait,
                },
                out,
            );
        }
    }

    /// The owner if it holds the whole canvas, otherwise the longest synced member.
    fn pick_uploader(&self) -> Option<UserId> {
        let synced = |u: &&User| u.is_synced() && !self.departure_reasons.contains_key(&u.id);
        self.users
            .get(&self.owner)
            .filter(synced)
            .or_else(|| self.users.values().find(synced))
            .map(|u| u.id)
    }

    fn request_upload(&mut self, uploader: UserId, joiners: &[UserId], out: &mut Outbox) {
        log::debug!(
            "Asking user {} for the canvas of session {} for {} users",
            uploader,
            self.id,
            joiners.len()
        );
        for id in joiners {
            if let Some(user) = self.users.get_mut(id) {
                user.phase = SyncPhase::AwaitingUpload;
            }
        }
        self.upload = Some(Upload {
            from: uploader,
            buffer: RasterBuffer::new(),
            dirty: false,
        });
        self.send_to(uploader, Message::SyncWait, out);
    }

    fn handle_upload(&mut self, from: UserId, chunk: &Raster, out: &mut Outbox) {
        let progress = match self.upload.as_mut() {
            Some(upload) if upload.from == from => upload.buffer.receive(chunk),
            _ => {
                log::debug!("Dropping unrequested raster from user {}", from);
                return;
            }
        };

        match progress {
            Ok(RasterProgress::Partial(_)) => self.send_to(
                from,
                Message::Acknowledgement {
                    event: MessageKind::Raster,
                },
                out,
            ),
            Ok(RasterProgress::Complete) => {
                let snapshot = self
                    .upload
                    .take()
                    .and_then(|upload| upload.buffer.image().map(<[u8]>::to_vec))
                    .unwrap_or_default();
                let joiners = self.joiners(true);
                self.start_transfers(&joiners, snapshot, out);
                self.try_capture(out);
            }
            Err(err) => {
                log::warn!("Bad canvas upload from user {}: {}", from, err);
                self.abandon_upload(out);
                self.try_capture(out);
            }
        }
    }

    /// Gives up on the current upload. Joiners go back to waiting for a
    /// snapshot, unless they already got drawing that a later snapshot would
    /// contain a second time. Those are dropped.
    fn abandon_upload(&mut self, out: &mut Outbox) {
        let upload = match self.upload.take() {
            Some(upload) => upload,
            None => return,
        };
        for id in self.joiners(true) {
            if upload.dirty {
                log::warn!("Dropping user {} whose snapshot was lost", id);
                self.drop_user(id, out);
            } else if let Some(user) = self.users.get_mut(&id) {
                user.phase = SyncPhase::AwaitingSnapshot;
            }
        }
    }

    fn start_transfers(&mut self, joiners: &[UserId], snapshot: Vec<u8>, out: &mut Outbox) {
        log::debug!(
            "Captured {} byte snapshot of session {} for {} users",
            snapshot.len(),
            self.id,
            joiners.len()
        );
        for &id in joiners {
            let mut transfer = match RasterTransfer::with_chunk_size(snapshot.clone(), self.chunk_size) {
                Ok(transfer) => transfer,
                Err(err) => {
                    log::error!("Cannot send the snapshot of session {}: {}", self.id, err);
                    self.drop_user(id, out);
                    continue;
                }
            };
            if let Some(chunk) = transfer.next_chunk() {
                self.send_to(id, Message::Raster(chunk), out);
            }
            if let Some(user) = self.users.get_mut(&id) {
                user.phase = if transfer.is_finished() {
                    SyncPhase::Synced
                } else {
                    SyncPhase::Receiving(transfer)
                };
            }
        }
    }

    fn drop_user(&mut self, id: UserId, out: &mut Outbox) {
        if let Some(user) = self.users.get(&id) {
            self.departure_reasons.insert(id, UserEvent::Dropped);
            out.close(user.connection, DisconnectReason::Shutdown);
        }
    }

    fn send_next_chunk(&mut self, id: UserId, out: &mut Outbox) {
        let session_id = self.id;
        let user = match self.users.get_mut(&id) {
            Some(user) => user,
            None => return,
        };
        let connection = user.connection;
        let finished = match &mut user.phase {
            SyncPhase::Receiving(transfer) => {
                if let Some(chunk) = transfer.next_chunk() {
                    out.send(
                        connection,
                        SessionMessage::new(session_id, Message::Raster(chunk)),
                    );
                }
                transfer.is_finished()
            }
            _ => {
                log::debug!("User {} acknowledged a raster it is not receiving", id);
                return;
            }
        };
        if finished {
            user.phase = SyncPhase::Synced;
        }
    }

    /// Removes a user. Returns the departure reason announced to the others,
    /// which is the one the server asked for when it initiated the departure.
    pub fn remove_user(&mut self, id: UserId, reason: UserEvent, out: &mut Outbox) -> Option<UserEvent> {
        let user = self.users.remove(&id)?;
        let reason = self.departure_reasons.remove(&id).unwrap_or(reason);
        self.awaiting_idle.remove(&id);
        self.idle.remove(&id);
        if self.upload.as_ref().map(|upload| upload.from) == Some(id) {
            self.abandon_upload(out);
        }
        log::info!(
            "User {} ({}) left session {}: {:?}",
            id,
            user.name,
            self.id,
            reason
        );

        self.broadcast(
            Message::UserInfo {
                event: reason,
                user: id,
                name: user.name,
                locked: user.locked,
            },
            out,
        );

        if self.owner == id {
            if let Some(&next) = self.users.keys().next() {
                self.owner = next;
                self.broadcast(
                    Message::SessionEvent {
                        action: SessionAction::Delegate,
                        target: Some(next),
                    },
                    out,
                );
            }
        }

        self.try_capture(out);
        Some(reason)
    }

    /// Asks every member to leave. The session closes once they are gone.
    pub fn terminate(&mut self, out: &mut Outbox) {
        if !self.terminating {
            log::info!(
                "Terminating session {} with {} users",
                self.id,
                self.users.len()
            );
        }
        self.terminating = true;
        for user in self.users.values() {
            self.departure_reasons.insert(user.id, UserEvent::Dropped);
            out.close(user.connection, DisconnectReason::Shutdown);
        }
    }

    pub fn kick(&mut self, target: UserId, out: &mut Outbox) -> bool {
        let connection = match self.users.get(&target) {
            Some(user) => user.connection,
            None => return false,
        };
        self.broadcast(
            Message::SessionEvent {
                action: SessionAction::Kick,
                target: Some(target),
            },
            out,
        );
        self.departure_reasons.insert(target, UserEvent::Kicked);
        out.close(connection, DisconnectReason::Kicked);
        true
    }

    /// Locks or unlocks one user, or the whole session when `target` is `None`.
    pub fn set_locked(&mut self, target: Option<UserId>, locked: bool, out: &mut Outbox) -> bool {
        match target {
            Some(id) => match self.users.get_mut(&id) {
                Some(user) => user.locked = locked,
                None => return false,
            },
            None => self.mode.locked = locked,
        }
        let action = if locked {
            SessionAction::Lock
        } else {
            SessionAction::Unlock
        };
        self.broadcast(Message::SessionEvent { action, target }, out);
        true
    }

    pub fn delegate(&mut self, target: UserId, out: &mut Outbox) -> bool {
        if !self.users.contains_key(&target) {
            return false;
        }
        self.owner = target;
        self.broadcast(
            Message::SessionEvent {
                action: SessionAction::Delegate,
                target: Some(target),
            },
            out,
        );
        true
    }

    /// Changes canvas size, user limit and mode at once. The canvas may only grow.
    pub fn alter(
        &mut self,
        width: u16,
        height: u16,
        user_limit: u8,
        mode: SessionMode,
        out: &mut Outbox,
    ) -> bool {
        if width < self.width || height < self.height {
            log::warn!(
                "Refusing to shrink session {} from {}x{} to {}x{}",
                self.id,
                self.width,
                self.height,
                width,
                height
            );
            return false;
        }
        let mut mode = mode;
        if mode.persistent && !self.mode.persistent && !self.persistence_allowed {
            log::warn!("Persistence is disabled, session {} stays temporary", self.id);
            mode.persistent = false;
        }
        self.width = width;
        self.height = height;
        self.user_limit = user_limit.max(1);
        self.mode = mode;
        self.broadcast(
            Message::Instruction {
                command: AdminCommand::Alter,
                width: self.width,
                height: self.height,
                user_limit: self.user_limit,
                mode: self.mode,
            },
            out,
        );
        true
    }

    fn wrap(&self, message: Message) -> SessionMessage {
        SessionMessage::new(self.id, message)
    }

    fn send_to(&self, id: UserId, message: Message, out: &mut Outbox) {
        if let Some(user) = self.users.get(&id) {
            out.send(user.connection, self.wrap(message));
        }
    }

    fn broadcast(&self, message: Message, out: &mut Outbox) {
        for user in self.users.values() {
            out.send(user.connection, self.wrap(message.clone()));
        }
    }
}
