//! Persisted per-device record and tag index.
//!
//! The core only needs `read_db`/`update_db`/`delete_db`/
//! `set_is_initialized`/`get_usec_initialized` (distilled spec §6); the
//! encoding is this crate's concern, not the core's, so it is a plain
//! `serde_json` file keyed by [`device_id`].

use crate::device::{device_id, Device};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A symlink this device claims, with its priority (higher wins when two
/// devices claim the same link name).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkClaim {
    pub path: String,
    pub priority: i32,
}

/// The persisted record for one device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbRecord {
    pub devlinks: Vec<LinkClaim>,
    pub properties: HashMap<String, String>,
    pub tags: Vec<String>,
    pub usec_initialized: Option<u64>,
    pub is_initialized: bool,
}

pub struct Db {
    state_dir: PathBuf,
}

impl Db {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn data_dir(&self) -> PathBuf {
        self.state_dir.join("data")
    }

    fn tags_dir(&self) -> PathBuf {
        self.state_dir.join("tags")
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.data_dir().join(id)
    }

    /// Load the prior record for `dev` and merge its properties/tags/
    /// devlinks back into `dev`, as `udev_device_read_db` does.
    pub fn read_db(&self, dev: &mut Device) -> Result<Option<DbRecord>> {
        let id = device_id(dev);
        let path = self.record_path(&id);

        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading db record {:?}", path))?;
        let record: DbRecord = serde_json::from_str(&content)
            .with_context(|| format!("parsing db record {:?}", path))?;

        for (k, v) in &record.properties {
            dev.properties.insert(k.clone(), v.clone());
        }
        for tag in &record.tags {
            dev.add_tag(tag);
        }
        dev.devlinks = record.devlinks.iter().map(|c| c.path.clone()).collect();

        Ok(Some(record))
    }

    /// Fetch the prior record without mutating `dev`.
    pub fn peek(&self, dev: &Device) -> Option<DbRecord> {
        let path = self.record_path(&device_id(dev));
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn get_usec_initialized(&self, dev: &Device) -> Option<u64> {
        self.peek(dev).and_then(|r| r.usec_initialized)
    }

    /// (Re)write the db record for `dev`, diffing devlinks/tags against
    /// `prior` (the before-image loaded at event start) purely for
    /// logging purposes — the record itself always reflects current state.
    pub fn update_db(
        &self,
        dev: &Device,
        links: &[LinkClaim],
        usec_initialized: Option<u64>,
        is_initialized: bool,
    ) -> Result<()> {
        std::fs::create_dir_all(self.data_dir())?;

        let record = DbRecord {
            devlinks: links.to_vec(),
            properties: dev.properties.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            tags: dev.tags.clone(),
            usec_initialized,
            is_initialized,
        };

        let path = self.record_path(&device_id(dev));
        let tmp = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(&record)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;

        Ok(())
    }

    pub fn delete_db(&self, dev: &Device) -> Result<()> {
        let path = self.record_path(&device_id(dev));
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Directory tree under `tags/<tag>/<device-id>` — one empty file per
    /// tagged device, so consumers can enumerate "all devices tagged T"
    /// by listing a directory.
    pub fn tag_index(&self, dev: &Device, prior: Option<&DbRecord>, add: bool) -> Result<()> {
        let id = device_id(dev);

        if let Some(prior) = prior {
            for tag in &prior.tags {
                if !add || !dev.tags.iter().any(|t| t == tag) {
                    let tag_file = self.tags_dir().join(tag).join(&id);
                    let _ = std::fs::remove_file(tag_file);
                }
            }
        }

        if add {
            for tag in &dev.tags {
                let dir = self.tags_dir().join(tag);
                std::fs::create_dir_all(&dir)?;
                std::fs::write(dir.join(&id), b"")?;
            }
        } else {
            // `remove` path: drop every tag entry unconditionally.
            if let Ok(entries) = std::fs::read_dir(self.tags_dir()) {
                for entry in entries.flatten() {
                    let _ = std::fs::remove_file(entry.path().join(&id));
                }
            }
        }

        Ok(())
    }

    pub fn tagged_devices(&self, tag: &str) -> Vec<String> {
        let dir = self.tags_dir().join(tag);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .collect()
    }
}

pub fn warn_on_io_error(context: &str, err: &anyhow::Error) {
    warn!("db io error ({}): {}", context, err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Action;

    fn dev() -> Device {
        let mut d = Device::bare("sda", Action::Add);
        d.subsystem = Some("block".into());
        d.major = Some(8);
        d.minor = Some(0);
        d
    }

    #[test]
    fn write_then_read_roundtrips_properties_and_tags() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Db::new(tmp.path());

        let mut d = dev();
        d.properties.insert("ID_BUS", "ata");
        d.add_tag("systemd");

        let links = vec![LinkClaim { path: "/dev/disk/by-id/x".into(), priority: 0 }];
        db.update_db(&d, &links, Some(123), true).unwrap();

        let mut reloaded = dev();
        let record = db.read_db(&mut reloaded).unwrap().unwrap();
        assert_eq!(record.usec_initialized, Some(123));
        assert_eq!(reloaded.property("ID_BUS"), Some("ata"));
        assert!(reloaded.has_tag("systemd"));
        assert_eq!(reloaded.devlinks, vec!["/dev/disk/by-id/x".to_string()]);
    }

    #[test]
    fn delete_db_removes_record() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Db::new(tmp.path());
        let d = dev();

        db.update_db(&d, &[], None, true).unwrap();
        assert!(db.peek(&d).is_some());

        db.delete_db(&d).unwrap();
        assert!(db.peek(&d).is_none());
        // Idempotent.
        db.delete_db(&d).unwrap();
    }

    #[test]
    fn tag_index_adds_and_removes_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Db::new(tmp.path());
        let mut d = dev();
        d.add_tag("systemd");

        db.tag_index(&d, None, true).unwrap();
        assert_eq!(db.tagged_devices("systemd"), vec![device_id(&d)]);

        db.tag_index(&d, None, false).unwrap();
        assert!(db.tagged_devices("systemd").is_empty());
    }
}
