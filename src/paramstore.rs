//! Stand-in for the key/value parameter store (spec §6): one file per key
//! under a state directory, mirroring the pack's file-backed state-dir
//! pattern for daemon configuration.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::errors::Result;

pub const CLEAR_ON_IGNITION_ON: &str = "CLEAR_ON_IGNITION_ON";
pub const CLEAR_ON_IGNITION_OFF: &str = "CLEAR_ON_IGNITION_OFF";

/// Keys this daemon reads or writes, and the tag (if any) that
/// `clear_all` should erase them under.
const KEY_TAGS: &[(&str, Option<&str>)] = &[
    ("CarVin", Some(CLEAR_ON_IGNITION_OFF)),
    ("CarParams", Some(CLEAR_ON_IGNITION_OFF)),
    ("ControlsReady", Some(CLEAR_ON_IGNITION_ON)),
    ("PandaFirmware", None),
    ("PandaFirmwareHex", None),
    ("PandaDongleId", None),
];

pub trait ParamStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn get_bool(&self, key: &str) -> Result<bool>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn clear_all(&self, tag: &str) -> Result<()>;
}

/// File-per-key implementation. Each key's file lives directly under
/// `state_dir`; `clear_all` removes every file whose static tag matches.
pub struct FileParamStore {
    state_dir: PathBuf,
}

impl FileParamStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir).map_err(|source| crate::errors::Error::BoardIo {
            board: "paramstore",
            source,
        })?;
        Ok(Self { state_dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.state_dir.join(key)
    }
}

impl ParamStore for FileParamStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(crate::errors::Error::BoardIo {
                board: "paramstore",
                source,
            }),
        }
    }

    fn get_bool(&self, key: &str) -> Result<bool> {
        Ok(matches!(self.get(key)?.as_deref(), Some([1])))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        fs::write(self.path_for(key), value).map_err(|source| crate::errors::Error::BoardIo {
            board: "paramstore",
            source,
        })
    }

    fn clear_all(&self, tag: &str) -> Result<()> {
        for (key, key_tag) in KEY_TAGS {
            if *key_tag == Some(tag) {
                let path = self.path_for(key);
                if path.exists() {
                    fs::remove_file(&path).map_err(|source| crate::errors::Error::BoardIo {
                        board: "paramstore",
                        source,
                    })?;
                }
            }
        }
        Ok(())
    }
}

/// In-memory store used by tests and by modules that only need the trait
/// boundary, not durability.
#[derive(Default)]
pub struct MemParamStore {
    values: std::sync::Mutex<HashMap<String, Vec<u8>>>,
}

impl MemParamStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParamStore for MemParamStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    fn get_bool(&self, key: &str) -> Result<bool> {
        Ok(matches!(self.get(key)?.as_deref(), Some([1])))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn clear_all(&self, tag: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap();
        for (key, key_tag) in KEY_TAGS {
            if *key_tag == Some(tag) {
                values.remove(*key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_store_round_trips_bytes() {
        let store = MemParamStore::new();
        store.put("CarVin", b"1HGCM82633A123456").unwrap();
        assert_eq!(
            store.get("CarVin").unwrap(),
            Some(b"1HGCM82633A123456".to_vec())
        );
    }

    #[test]
    fn clear_all_only_removes_matching_tag() {
        let store = MemParamStore::new();
        store.put("CarVin", b"x").unwrap();
        store.put("ControlsReady", &[1]).unwrap();
        store.clear_all(CLEAR_ON_IGNITION_OFF).unwrap();
        assert_eq!(store.get("CarVin").unwrap(), None);
        assert!(store.get_bool("ControlsReady").unwrap());
    }

    #[test]
    fn get_bool_false_when_absent() {
        let store = MemParamStore::new();
        assert!(!store.get_bool("ControlsReady").unwrap());
    }
}
