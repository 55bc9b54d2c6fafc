use crate::types::{SessionId, SessionInfo, SessionMode, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire frame. Every message is addressed to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub session_id: SessionId,
    pub message: Message,
}

impl SessionMessage {
    pub fn new(session_id: SessionId, message: Message) -> Self {
        Self {
            session_id,
            message,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(CodecError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(CodecError::Decode)
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("cannot encode message: {0}")]
    Encode(bincode::Error),
    #[error("cannot decode message: {0}")]
    Decode(bincode::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    SessionSelect,
    Raster(Raster),
    ToolInfo(ToolInfo),
    StrokeInfo(StrokeInfo),
    StrokeEnd {
        user: UserId,
    },
    Chat {
        user: UserId,
        data: Vec<u8>,
    },
    Synchronize,
    SyncWait,
    Acknowledgement {
        event: MessageKind,
    },
    SessionEvent {
        action: SessionAction,
        target: Option<UserId>,
    },
    UserInfo {
        event: UserEvent,
        user: UserId,
        name: String,
        locked: bool,
    },
    Instruction {
        command: AdminCommand,
        width: u16,
        height: u16,
        user_limit: u8,
        mode: SessionMode,
    },
    Host {
        name: String,
        alias: Option<String>,
        width: u16,
        height: u16,
        user_limit: u8,
        mode: SessionMode,
    },
    Joined {
        user: UserId,
        session: SessionInfo,
    },
    Error(ErrorCode),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::SessionSelect => MessageKind::SessionSelect,
            Message::Raster(_) => MessageKind::Raster,
            Message::ToolInfo(_) => MessageKind::ToolInfo,
            Message::StrokeInfo(_) => MessageKind::StrokeInfo,
            Message::StrokeEnd { .. } => MessageKind::StrokeEnd,
            Message::Chat { .. } => MessageKind::Chat,
            Message::Synchronize => MessageKind::Synchronize,
            Message::SyncWait => MessageKind::SyncWait,
            Message::Acknowledgement { .. } => MessageKind::Acknowledgement,
            Message::SessionEvent { .. } => MessageKind::SessionEvent,
            Message::UserInfo { .. } => MessageKind::UserInfo,
            Message::Instruction { .. } => MessageKind::Instruction,
            Message::Host { .. } => MessageKind::Host,
            Message::Joined { .. } => MessageKind::Joined,
            Message::Error(_) => MessageKind::Error,
        }
    }

    /// Takes ownership of the message if it is a drawing operation.
    pub fn into_draw_operation(self) -> Result<DrawOperation, Message> {
        match self {
            Message::ToolInfo(tool) => Ok(DrawOperation::ToolInfo(tool)),
            Message::StrokeInfo(point) => Ok(DrawOperation::StrokeInfo(point)),
            Message::StrokeEnd { user } => Ok(DrawOperation::StrokeEnd { user }),
            other => Err(other),
        }
    }
}

/// Message type tag, used by acknowledgements to name what is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    SessionSelect,
    Raster,
    ToolInfo,
    StrokeInfo,
    StrokeEnd,
    Chat,
    Synchronize,
    SyncWait,
    Acknowledgement,
    SessionEvent,
    UserInfo,
    Instruction,
    Host,
    Joined,
    Error,
}

/// One chunk of a raster snapshot transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Raster {
    pub offset: u32,
    pub length: u32,
    pub size: u32,
    pub data: Vec<u8>,
}

impl Raster {
    /// Sentinel chunk of a zero-size transfer (empty canvas).
    pub fn empty() -> Self {
        Self {
            offset: 0,
            length: 0,
            size: 0,
            data: Vec::new(),
        }
    }

    pub fn is_last(&self) -> bool {
        self.size == 0
            || u64::from(self.offset) + u64::from(self.length) >= u64::from(self.size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolKind {
    Brush,
    Eraser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolMode {
    Normal,
}

/// Tool parameters. Each attribute has a low-pressure and a high-pressure endpoint;
/// colors are RGBA with the opacity in the alpha channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub user: UserId,
    pub tool: ToolKind,
    pub mode: ToolMode,
    pub lo_color: [u8; 4],
    pub hi_color: [u8; 4],
    pub lo_size: u8,
    pub hi_size: u8,
    pub lo_hardness: u8,
    pub hi_hardness: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrokeInfo {
    pub user: UserId,
    pub x: i16,
    pub y: i16,
    pub pressure: u8,
}

/// A unit of drawing protocol. Owned values, so a queued operation is released
/// when it is taken out of the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrawOperation {
    ToolInfo(ToolInfo),
    StrokeInfo(StrokeInfo),
    StrokeEnd { user: UserId },
}

impl DrawOperation {
    pub fn user(&self) -> UserId {
        match self {
            DrawOperation::ToolInfo(tool) => tool.user,
            DrawOperation::StrokeInfo(point) => point.user,
            DrawOperation::StrokeEnd { user } => *user,
        }
    }

    /// Same operation attributed to `user`.
    pub fn with_user(self, user: UserId) -> Self {
        match self {
            DrawOperation::ToolInfo(tool) => DrawOperation::ToolInfo(ToolInfo { user, ..tool }),
            DrawOperation::StrokeInfo(point) => {
                DrawOperation::StrokeInfo(StrokeInfo { user, ..point })
            }
            DrawOperation::StrokeEnd { .. } => DrawOperation::StrokeEnd { user },
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            DrawOperation::ToolInfo(tool) => Message::ToolInfo(tool),
            DrawOperation::StrokeInfo(point) => Message::StrokeInfo(point),
            DrawOperation::StrokeEnd { user } => Message::StrokeEnd { user },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionAction {
    Lock,
    Unlock,
    Kick,
    Delegate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserEvent {
    Join,
    Leave,
    Disconnect,
    BrokenPipe,
    TimedOut,
    Dropped,
    Kicked,
}

impl UserEvent {
    pub fn is_departure(&self) -> bool {
        !matches!(self, UserEvent::Join)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminCommand {
    Alter,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NoSuchSession,
    SessionFull,
    TooManySessions,
    AliasTaken,
    AlreadyInSession,
    NotInSession,
}

/// Why the server closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    Banned,
    Kicked,
    Shutdown,
    /// No connection slot left.
    ServerFull,
}

impl DisconnectReason {
    pub fn code(&self) -> &'static str {
        match self {
            DisconnectReason::Banned => "BANNED",
            DisconnectReason::Kicked => "KICKED",
            DisconnectReason::Shutdown => "SHUTDOWN",
            DisconnectReason::ServerFull => "SERVER_FULL",
        }
    }
}
