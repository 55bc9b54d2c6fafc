use serde::{Deserialize, Serialize};

pub type ConnectionId = u16;
pub type SessionId = u32;
pub type UserId = u32;

/// Mode flags of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMode {
    pub locked: bool,
    pub persistent: bool,
}

/// Public description of a drawing session, as seen by its members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub alias: Option<String>,
    pub owner: UserId,
    pub width: u16,
    pub height: u16,
    pub user_limit: u8,
    pub mode: SessionMode,
}

impl SessionInfo {
    /// Alias if one was assigned, otherwise the numeric id.
    pub fn id_alias(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }
}
