use system::SessionId;

/// Source of the canonical canvas content of a session.
///
/// Called when the session has reached a consistent point and a snapshot must
/// be sent to joining users. The bytes are opaque to the server. `None` means
/// the server holds no copy of the canvas and the session collects one from a
/// synced member instead.
pub trait SnapshotProvider: Send + Sync {
    fn current_snapshot(&self, session: SessionId) -> Option<Vec<u8>>;
}

/// Every session starts and stays an empty canvas.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlankCanvas;

impl SnapshotProvider for BlankCanvas {
    fn current_snapshot(&self, _session: SessionId) -> Option<Vec<u8>> {
        Some(Vec::new())
    }
}

/// Same snapshot for every session.
#[derive(Debug, Default, Clone)]
pub struct FixedSnapshot(pub Vec<u8>);

impl SnapshotProvider for FixedSnapshot {
    fn current_snapshot(&self, _session: SessionId) -> Option<Vec<u8>> {
        Some(self.0.clone())
    }
}

/// The canvas lives with the clients. Each capture asks a member to upload it.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemberUpload;

impl SnapshotProvider for MemberUpload {
    fn current_snapshot(&self, _session: SessionId) -> Option<Vec<u8>> {
        None
    }
}
