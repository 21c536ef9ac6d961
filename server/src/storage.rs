//! Character persistence behind a swappable store trait.
//!
//! Each character persists as five independently versioned records
//! (appearance, location, inventory, skills, energies) plus an account
//! record, all loaded by character name. The on-disk encoding is bincode,
//! one file per record kind; tests use the in-memory store. Failures here
//! never reach the tick loop as panics — the call site that triggered the
//! load/save turns them into a user-visible message.

use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug)]
pub enum StorageError {
    /// No record set exists under that name.
    NotFound(String),
    Io(std::io::Error),
    Encoding(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::NotFound(name) => write!(f, "no character named '{}'", name),
            StorageError::Io(e) => write!(f, "storage I/O failure: {}", e),
            StorageError::Encoding(e) => write!(f, "storage encoding failure: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Encoding(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub version: u8,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppearanceRecord {
    pub version: u8,
    pub kind: u8,
    pub skin: u8,
    pub hair: u8,
    pub shirt: u8,
    pub pants: u8,
    pub boots: u8,
    pub head: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub version: u8,
    /// Map name; must round-trip exactly through save/load.
    pub map: String,
    pub x: u16,
    pub y: u16,
    pub z: u8,
    pub rotation: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub version: u8,
    /// (item id, quantity) pairs.
    pub items: Vec<(u16, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillsRecord {
    pub version: u8,
    /// (skill name, level, experience) triples.
    pub skills: Vec<(String, u16, u64)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnergiesRecord {
    pub version: u8,
    pub health: u16,
    pub max_health: u16,
    pub mana: u16,
    pub max_mana: u16,
}

/// The full persisted state of one character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterRecord {
    pub name: String,
    pub account: AccountRecord,
    pub appearance: AppearanceRecord,
    pub location: LocationRecord,
    pub inventory: InventoryRecord,
    pub skills: SkillsRecord,
    pub energies: EnergiesRecord,
}

impl CharacterRecord {
    /// A fresh character standing at the given spot.
    pub fn new(name: &str, password: &str, map: &str, x: u16, y: u16) -> Self {
        Self {
            name: name.to_string(),
            account: AccountRecord {
                version: 1,
                password: password.to_string(),
            },
            appearance: AppearanceRecord {
                version: 1,
                kind: 1,
                skin: 1,
                hair: 1,
                shirt: 1,
                pants: 1,
                boots: 1,
                head: 1,
            },
            location: LocationRecord {
                version: 1,
                map: map.to_string(),
                x,
                y,
                z: 0,
                rotation: 0,
            },
            inventory: InventoryRecord {
                version: 1,
                items: Vec::new(),
            },
            skills: SkillsRecord {
                version: 1,
                skills: Vec::new(),
            },
            energies: EnergiesRecord {
                version: 1,
                health: 50,
                max_health: 50,
                mana: 30,
                max_mana: 30,
            },
        }
    }
}

/// Load/save interface consumed by the world loop.
pub trait CharacterStore: Send {
    fn load(&self, name: &str) -> Result<CharacterRecord, StorageError>;
    fn save(&self, record: &CharacterRecord) -> Result<(), StorageError>;
    fn exists(&self, name: &str) -> bool;
}

/// One bincode file per record kind under a data directory.
pub struct FileStore {
    dir: PathBuf,
}

const RECORD_KINDS: [&str; 6] = [
    "account",
    "appearance",
    "location",
    "inventory",
    "skills",
    "energies",
];

impl FileStore {
    pub fn new(dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        info!("Character store at {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn record_path(&self, name: &str, kind: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name.to_lowercase(), kind))
    }

    fn read_record<T: for<'de> Deserialize<'de>>(
        &self,
        name: &str,
        kind: &str,
    ) -> Result<T, StorageError> {
        let bytes = fs::read(self.record_path(name, kind))?;
        Ok(bincode::deserialize(&bytes)?)
    }

    fn write_record<T: Serialize>(
        &self,
        name: &str,
        kind: &str,
        record: &T,
    ) -> Result<(), StorageError> {
        let bytes = bincode::serialize(record)?;
        fs::write(self.record_path(name, kind), bytes)?;
        Ok(())
    }
}

impl CharacterStore for FileStore {
    fn load(&self, name: &str) -> Result<CharacterRecord, StorageError> {
        if !self.exists(name) {
            return Err(StorageError::NotFound(name.to_string()));
        }
        Ok(CharacterRecord {
            name: name.to_string(),
            account: self.read_record(name, "account")?,
            appearance: self.read_record(name, "appearance")?,
            location: self.read_record(name, "location")?,
            inventory: self.read_record(name, "inventory")?,
            skills: self.read_record(name, "skills")?,
            energies: self.read_record(name, "energies")?,
        })
    }

    fn save(&self, record: &CharacterRecord) -> Result<(), StorageError> {
        let name = &record.name;
        self.write_record(name, "account", &record.account)?;
        self.write_record(name, "appearance", &record.appearance)?;
        self.write_record(name, "location", &record.location)?;
        self.write_record(name, "inventory", &record.inventory)?;
        self.write_record(name, "skills", &record.skills)?;
        self.write_record(name, "energies", &record.energies)?;
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        RECORD_KINDS
            .iter()
            .all(|kind| self.record_path(name, kind).is_file())
    }
}

/// Keeps everything in a map; backs unit and scenario tests.
pub struct MemoryStore {
    records: Mutex<HashMap<String, CharacterRecord>>,
    /// When set, every load/save fails; exercises the error paths.
    fail: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            fail: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn with_character(record: CharacterRecord) -> Self {
        let store = Self::new();
        store.insert(record);
        store
    }

    pub fn insert(&self, record: CharacterRecord) {
        self.lock().insert(record.name.to_lowercase(), record);
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail
            .store(failing, std::sync::atomic::Ordering::Relaxed);
    }

    fn failing(&self) -> bool {
        self.fail.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CharacterRecord>> {
        match self.records.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CharacterStore for MemoryStore {
    fn load(&self, name: &str) -> Result<CharacterRecord, StorageError> {
        if self.failing() {
            return Err(StorageError::Encoding("simulated failure".to_string()));
        }
        self.lock()
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    fn save(&self, record: &CharacterRecord) -> Result<(), StorageError> {
        if self.failing() {
            return Err(StorageError::Encoding("simulated failure".to_string()));
        }
        self.insert(record.clone());
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        !self.failing() && self.lock().contains_key(&name.to_lowercase())
    }
}
