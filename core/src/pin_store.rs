/// Pin ranking persistence: one key-value slot that survives restarts
use crate::error::{Result, SyncError};
use crate::messenger_types::ConversationId;
use std::path::Path;
use std::sync::Mutex;

/// Fixed key of the persisted server pin ranking
pub const SERVER_PINS_KEY: &str = "SERVER_PINS";

/// Storage for the ordered list of pinned ids
pub trait PinStorage: Send + Sync {
    fn load(&self) -> Result<Vec<ConversationId>>;
    fn save(&self, ids: &[ConversationId]) -> Result<()>;
}

/// Pin slot backed by sled
pub struct SledPinStorage {
    db: sled::Db,
}

impl SledPinStorage {
    /// Open (or create) the pin store in the given data directory
    pub fn new(data_dir: &Path) -> Result<Self> {
        let db = sled::open(data_dir.join("pins.db"))
            .map_err(|e| SyncError::Storage(format!("Failed to open pins DB: {}", e)))?;
        Ok(Self { db })
    }
}

impl PinStorage for SledPinStorage {
    fn load(&self) -> Result<Vec<ConversationId>> {
        match self
            .db
            .get(SERVER_PINS_KEY.as_bytes())
            .map_err(|e| SyncError::Storage(format!("load pins: {}", e)))?
        {
            Some(val) => Ok(serde_json::from_slice(&val)?),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, ids: &[ConversationId]) -> Result<()> {
        let val = serde_json::to_vec(ids)?;
        self.db
            .insert(SERVER_PINS_KEY.as_bytes(), val)
            .map_err(|e| SyncError::Storage(format!("save pins: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| SyncError::Storage(format!("flush pins: {}", e)))?;
        Ok(())
    }
}

impl Clone for SledPinStorage {
    fn clone(&self) -> Self {
        Self { db: self.db.clone() }
    }
}

/// Process-local pin slot
#[derive(Default)]
pub struct MemoryPinStorage {
    slot: Mutex<Vec<ConversationId>>,
}

impl MemoryPinStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids(ids: Vec<ConversationId>) -> Self {
        Self {
            slot: Mutex::new(ids),
        }
    }
}

impl PinStorage for MemoryPinStorage {
    fn load(&self) -> Result<Vec<ConversationId>> {
        let slot = self
            .slot
            .lock()
            .map_err(|_| SyncError::Storage("pin slot poisoned".to_string()))?;
        Ok(slot.clone())
    }

    fn save(&self, ids: &[ConversationId]) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| SyncError::Storage("pin slot poisoned".to_string()))?;
        *slot = ids.to_vec();
        Ok(())
    }
}
