use crate::message::{
    AdminCommand, DrawOperation, Message, MessageKind, Raster, SessionAction, SessionMessage,
    StrokeInfo, ToolInfo, UserEvent,
};
use crate::raster::{RasterBuffer, RasterError, RasterProgress, RasterTransfer};
use crate::types::{SessionInfo, UserId};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;

const UNKNOWN_USER_NAME: &str = "<unknown>";

/// What happened to a message handed to [`SessionState::handle_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Consumed,
    /// Queued until the session raster is complete.
    Buffered,
    /// Logged and discarded.
    Dropped,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionStateError {
    #[error(transparent)]
    Raster(#[from] RasterError),
    #[error("cannot start drawing now")]
    Frozen,
}

/// Things the user interface should react to, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    RasterReceived(u8),
    /// The server wants this client's canvas; answer with [`SessionState::send_raster`].
    UploadRequested,
    RasterSent(u8),
    ToolReceived(ToolInfo),
    StrokeReceived(StrokeInfo),
    StrokeEndReceived(UserId),
    UserJoined(UserId),
    UserLeft(UserId, UserEvent),
    UserLocked(UserId, bool),
    SessionLocked(bool),
    UserKicked(UserId),
    OwnerChanged(UserId),
    UserLimitChanged(u8),
    ChatMessage { from: String, text: String },
    SyncRequested,
    SyncDone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Idle,
    /// Asked to synchronize while a stroke was in progress.
    AckPending,
    /// Acknowledged, drawing frozen until released by the server.
    Waiting,
}

/// Local mirror of a session joined by this client.
///
/// Drawing operations received before the session raster is complete are
/// buffered, then replayed in receipt order once the last chunk arrives. After
/// that first flush buffering stays off for the lifetime of the connection.
pub struct SessionState {
    info: SessionInfo,
    local_user: UserId,
    users: BTreeMap<UserId, User>,
    raster: RasterBuffer,
    buffer_drawing: bool,
    draw_buffer: VecDeque<DrawOperation>,
    sync: SyncState,
    stroke_in_progress: bool,
    upload: Option<RasterTransfer>,
    pending_notifications: VecDeque<Notification>,
    outgoing: VecDeque<SessionMessage>,
}

impl SessionState {
    pub fn new(local_user: UserId, name: &str, info: SessionInfo) -> Self {
        let mut users = BTreeMap::new();
        users.insert(
            local_user,
            User {
                id: local_user,
                name: name.to_owned(),
                locked: false,
            },
        );
        Self {
            info,
            local_user,
            users,
            raster: RasterBuffer::new(),
            buffer_drawing: true,
            draw_buffer: VecDeque::new(),
            sync: SyncState::Idle,
            stroke_in_progress: false,
            upload: None,
            pending_notifications: VecDeque::new(),
            outgoing: VecDeque::new(),
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    pub fn has_user(&self, id: UserId) -> bool {
        self.users.contains_key(&id)
    }

    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn is_locked(&self) -> bool {
        self.info.mode.locked
    }

    pub fn is_buffering(&self) -> bool {
        self.buffer_drawing
    }

    pub fn buffered_operations(&self) -> usize {
        self.draw_buffer.len()
    }

    pub fn is_sync_waiting(&self) -> bool {
        self.sync != SyncState::Idle
    }

    pub fn is_uploading(&self) -> bool {
        self.upload.is_some()
    }

    /// Session raster, once completely received. Empty for an empty canvas.
    pub fn session_image(&self) -> Option<&[u8]> {
        self.raster.image()
    }

    pub fn handle_message(&mut self, message: Message) -> Result<Disposition, SessionStateError> {
        let message = match message.into_draw_operation() {
            Ok(op) => return Ok(self.handle_draw_operation(op)),
            Err(message) => message,
        };

        match message {
            Message::Raster(raster) => self.handle_raster(&raster),
            Message::Chat { user, data } => {
                self.handle_chat(user, &data);
                Ok(Disposition::Consumed)
            }
            Message::Synchronize => {
                self.handle_sync_request();
                Ok(Disposition::Consumed)
            }
            Message::SyncWait => {
                self.notify(Notification::UploadRequested);
                Ok(Disposition::Consumed)
            }
            Message::Acknowledgement { event } => Ok(self.handle_ack(event)),
            Message::SessionEvent { action, target } => {
                Ok(self.handle_session_event(action, target))
            }
            Message::UserInfo {
                event,
                user,
                name,
                locked,
            } => Ok(self.handle_user_info(event, user, name, locked)),
            Message::Instruction {
                command: AdminCommand::Alter,
                width,
                height,
                user_limit,
                mode,
            } => {
                self.update(SessionInfo {
                    width,
                    height,
                    user_limit,
                    mode,
                    ..self.info.clone()
                });
                Ok(Disposition::Consumed)
            }
            other => {
                log::debug!("Unhandled session message: {:?}", other.kind());
                Ok(Disposition::Dropped)
            }
        }
    }

    /// Replaces the session description, reporting the changes users care about.
    pub fn update(&mut self, info: SessionInfo) {
        if info.user_limit != self.info.user_limit {
            self.notify(Notification::UserLimitChanged(info.user_limit));
        }
        if info.mode.locked != self.info.mode.locked {
            self.notify(Notification::SessionLocked(info.mode.locked));
        }
        if info.owner != self.info.owner {
            self.notify(Notification::OwnerChanged(info.owner));
        }
        self.info = info;
    }

    fn handle_raster(&mut self, raster: &Raster) -> Result<Disposition, SessionStateError> {
        match self.raster.receive(raster)? {
            RasterProgress::Partial(percent) => {
                self.notify(Notification::RasterReceived(percent));
                self.send(Message::Acknowledgement {
                    event: MessageKind::Raster,
                });
            }
            RasterProgress::Complete => {
                self.notify(Notification::RasterReceived(100));
                self.flush_draw_buffer();
            }
        }
        Ok(Disposition::Consumed)
    }

    fn handle_draw_operation(&mut self, op: DrawOperation) -> Disposition {
        if self.buffer_drawing {
            self.draw_buffer.push_back(op);
            return Disposition::Buffered;
        }
        self.deliver(op);
        Disposition::Consumed
    }

    fn deliver(&mut self, op: DrawOperation) {
        let notification = match op {
            DrawOperation::ToolInfo(tool) => Notification::ToolReceived(tool),
            DrawOperation::StrokeInfo(point) => Notification::StrokeReceived(point),
            DrawOperation::StrokeEnd { user } => Notification::StrokeEndReceived(user),
        };
        self.notify(notification);
    }

    fn flush_draw_buffer(&mut self) {
        self.buffer_drawing = false;
        while let Some(op) = self.draw_buffer.pop_front() {
            self.deliver(op);
        }
    }

    fn handle_chat(&mut self, user: UserId, data: &[u8]) {
        let from = self
            .users
            .get(&user)
            .map(|u| u.name.clone())
            .unwrap_or_else(|| UNKNOWN_USER_NAME.to_owned());
        let text = String::from_utf8_lossy(data).into_owned();
        self.notify(Notification::ChatMessage { from, text });
    }

    fn handle_sync_request(&mut self) {
        if self.sync != SyncState::Idle {
            log::debug!("Already synchronizing");
            return;
        }
        self.notify(Notification::SyncRequested);
        if self.stroke_in_progress {
            self.sync = SyncState::AckPending;
        } else {
            self.acknowledge_sync();
        }
    }

    fn acknowledge_sync(&mut self) {
        self.sync = SyncState::Waiting;
        self.send(Message::Acknowledgement {
            event: MessageKind::SyncWait,
        });
    }

    fn handle_ack(&mut self, event: MessageKind) -> Disposition {
        match event {
            MessageKind::SyncWait => {
                self.sync = SyncState::Idle;
                self.notify(Notification::SyncDone);
                Disposition::Consumed
            }
            MessageKind::SessionSelect => Disposition::Consumed,
            MessageKind::Raster => {
                self.send_raster_chunk();
                Disposition::Consumed
            }
            other => {
                log::debug!("Unhandled session ack: {:?}", other);
                Disposition::Dropped
            }
        }
    }

    fn handle_session_event(&mut self, action: SessionAction, target: Option<UserId>) -> Disposition {
        if let Some(id) = target {
            if !self.users.contains_key(&id) {
                log::warn!(
                    "Received {:?} for user {} who is not part of the session",
                    action,
                    id
                );
                return Disposition::Dropped;
            }
        }

        match (action, target) {
            (SessionAction::Lock, Some(id)) | (SessionAction::Unlock, Some(id)) => {
                let locked = action == SessionAction::Lock;
                if let Some(user) = self.users.get_mut(&id) {
                    user.locked = locked;
                }
                self.notify(Notification::UserLocked(id, locked));
            }
            (SessionAction::Lock, None) | (SessionAction::Unlock, None) => {
                let locked = action == SessionAction::Lock;
                self.info.mode.locked = locked;
                self.notify(Notification::SessionLocked(locked));
            }
            (SessionAction::Kick, Some(id)) => self.notify(Notification::UserKicked(id)),
            (SessionAction::Delegate, Some(id)) => {
                self.info.owner = id;
                self.notify(Notification::OwnerChanged(id));
            }
            (action, None) => {
                log::warn!("Session event {:?} needs a target user", action);
                return Disposition::Dropped;
            }
        }
        Disposition::Consumed
    }

    fn handle_user_info(
        &mut self,
        event: UserEvent,
        id: UserId,
        name: String,
        locked: bool,
    ) -> Disposition {
        if event == UserEvent::Join {
            self.users.insert(id, User { id, name, locked });
            self.notify(Notification::UserJoined(id));
        } else if self.users.remove(&id).is_some() {
            self.notify(Notification::UserLeft(id, event));
        } else {
            log::warn!("Got logout message for user {} not in session", id);
            return Disposition::Dropped;
        }
        Disposition::Consumed
    }

    fn can_draw(&self) -> bool {
        let locked_out = self.info.mode.locked && self.info.owner != self.local_user;
        let user_locked = self
            .users
            .get(&self.local_user)
            .map(|u| u.locked)
            .unwrap_or(false);
        !self.buffer_drawing && !locked_out && !user_locked
    }

    pub fn select(&mut self) {
        self.send(Message::SessionSelect);
    }

    pub fn send_tool_info(&mut self, tool: ToolInfo) -> Result<(), SessionStateError> {
        if !self.can_draw() || (self.sync != SyncState::Idle && !self.stroke_in_progress) {
            return Err(SessionStateError::Frozen);
        }
        self.send(Message::ToolInfo(ToolInfo {
            user: self.local_user,
            ..tool
        }));
        Ok(())
    }

    pub fn send_stroke_info(&mut self, x: i16, y: i16, pressure: u8) -> Result<(), SessionStateError> {
        if !self.can_draw() {
            return Err(SessionStateError::Frozen);
        }
        if !self.stroke_in_progress && self.sync != SyncState::Idle {
            return Err(SessionStateError::Frozen);
        }
        self.stroke_in_progress = true;
        self.send(Message::StrokeInfo(StrokeInfo {
            user: self.local_user,
            x,
            y,
            pressure,
        }));
        Ok(())
    }

    pub fn send_stroke_end(&mut self) {
        if !self.stroke_in_progress {
            return;
        }
        self.stroke_in_progress = false;
        self.send(Message::StrokeEnd {
            user: self.local_user,
        });
        if self.sync == SyncState::AckPending {
            self.acknowledge_sync();
        }
    }

    /// Starts uploading the local canvas. Chunks go out one per server
    /// acknowledgement, interleaved with other messages. A new upload replaces
    /// an unfinished one.
    pub fn send_raster(&mut self, raster: Vec<u8>) -> Result<(), SessionStateError> {
        self.upload = Some(RasterTransfer::new(raster)?);
        self.send_raster_chunk();
        Ok(())
    }

    /// Abandons an unfinished upload.
    pub fn release_raster(&mut self) {
        self.upload = None;
    }

    fn send_raster_chunk(&mut self) {
        let transfer = match self.upload.as_mut() {
            Some(transfer) => transfer,
            None => {
                log::debug!("Raster acknowledged with no upload in progress");
                return;
            }
        };
        let chunk = transfer.next_chunk();
        let progress = transfer.progress();
        if transfer.is_finished() {
            self.upload = None;
        }
        if let Some(chunk) = chunk {
            self.send(Message::Raster(chunk));
            self.notify(Notification::RasterSent(progress));
        }
    }

    pub fn send_chat(&mut self, text: &str) {
        self.send(Message::Chat {
            user: self.local_user,
            data: text.as_bytes().to_vec(),
        });
    }

    pub fn kick_user(&mut self, id: UserId) {
        self.send_session_event(SessionAction::Kick, Some(id));
    }

    pub fn lock_user(&mut self, id: UserId, lock: bool) {
        let action = if lock {
            SessionAction::Lock
        } else {
            SessionAction::Unlock
        };
        self.send_session_event(action, Some(id));
    }

    pub fn lock_session(&mut self, lock: bool) {
        let action = if lock {
            SessionAction::Lock
        } else {
            SessionAction::Unlock
        };
        self.send_session_event(action, None);
    }

    pub fn delegate(&mut self, id: UserId) {
        self.send_session_event(SessionAction::Delegate, Some(id));
    }

    /// Changes the user limit. Lowering it below the current user count only
    /// keeps new users out.
    pub fn set_user_limit(&mut self, count: u8) {
        log::debug!("Changing user limit to {}", count);
        self.send(Message::Instruction {
            command: AdminCommand::Alter,
            width: self.info.width,
            height: self.info.height,
            user_limit: count,
            mode: self.info.mode,
        });
    }

    pub fn leave(&mut self) {
        let name = self
            .users
            .get(&self.local_user)
            .map(|u| u.name.clone())
            .unwrap_or_default();
        self.send(Message::UserInfo {
            event: UserEvent::Leave,
            user: self.local_user,
            name,
            locked: false,
        });
    }

    fn send_session_event(&mut self, action: SessionAction, target: Option<UserId>) {
        self.send(Message::SessionEvent { action, target });
    }

    fn send(&mut self, message: Message) {
        self.outgoing
            .push_back(SessionMessage::new(self.info.id, message));
    }

    fn notify(&mut self, notification: Notification) {
        if self.pending_notifications.len() > 1000 {
            log::warn!("session notifications must be consumed");
        }
        self.pending_notifications.push_back(notification);
    }

    pub fn consume_notifications(&mut self) -> Vec<Notification> {
        self.pending_notifications.drain(..).collect()
    }

    pub fn consume_outgoing(&mut self) -> Vec<SessionMessage> {
        self.outgoing.drain(..).collect()
    }
}
