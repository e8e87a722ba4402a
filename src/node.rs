//! Device node manager (C5): idempotent ownership/mode application and
//! symlink claiming over the shared `/dev` namespace.
//!
//! Generalized from the existing crate's `devnode.rs`, which could create
//! a single node/symlink but had no notion of competing claimants. Here
//! each symlink name has a ledger of claims (device id + priority) under
//! the run-state directory; the highest-priority live claim wins the
//! target. The ledger directory is advisory-locked with `flock` so
//! concurrent workers (external to this core, per the concurrency model)
//! serialize on it.

use crate::db::LinkClaim;
use crate::device::{device_id, Device};
use anyhow::{anyhow, Result};
use nix::fcntl::{flock, FlockArg};
use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct NodeManager {
    state_dir: PathBuf,
}

struct DirLock {
    _file: std::fs::File,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = std::fs::File::open(dir)?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive)
            .map_err(|e| anyhow!("flock on {:?} failed: {}", dir, e))?;
        Ok(Self { _file: file })
    }
}

impl NodeManager {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn links_dir(&self) -> PathBuf {
        self.state_dir.join("links")
    }

    fn ledger_path(&self, link_name: &str) -> PathBuf {
        self.links_dir().join(escape_link_name(link_name))
    }

    /// Ensure `dev.devnode` exists with the given mode/uid/gid (when
    /// `apply`), then register+resolve every declared devlink. Safe to
    /// call repeatedly with the same arguments (idempotent per distilled
    /// spec §4.5).
    pub fn node_add(
        &self,
        dev: &Device,
        apply: bool,
        mode: u32,
        uid: u32,
        gid: u32,
        links: &[(String, i32)],
    ) -> Result<Vec<LinkClaim>> {
        if apply {
            if let Some(devnode) = &dev.devnode {
                create_node(dev, devnode, mode, uid, gid)?;
            }
        }

        let mut claims = Vec::new();
        for (link, priority) in links {
            self.claim_link(dev, link, *priority)?;
            claims.push(LinkClaim { path: link.clone(), priority: *priority });
        }

        Ok(claims)
    }

    /// Drop this device from every symlink ledger it might hold (the
    /// caller does not need to know which links that is), and unlink the
    /// device node itself if this device owns it.
    pub fn node_remove(&self, dev: &Device, owned_links: &[String]) -> Result<()> {
        for link in owned_links {
            self.release_link(dev, link)?;
        }

        if let Some(devnode) = &dev.devnode {
            remove_node_if_owned(devnode, dev.devnum())?;
        }

        Ok(())
    }

    /// For links present in `old_links` but not in `current_links`,
    /// release this device's claim — used to clean up symlinks a rule
    /// stopped declaring between events (distilled spec §4.5,
    /// `node_update_old_links`).
    pub fn update_old_links(
        &self,
        dev: &Device,
        old_links: &[String],
        current_links: &[String],
    ) -> Result<()> {
        for old in old_links {
            if !current_links.iter().any(|l| l == old) {
                self.release_link(dev, old)?;
            }
        }
        Ok(())
    }

    fn claim_link(&self, dev: &Device, link: &str, priority: i32) -> Result<()> {
        let _lock = DirLock::acquire(&self.links_dir())?;
        let id = device_id(dev);
        let ledger_path = self.ledger_path(link);

        let mut ledger = load_ledger(&ledger_path);
        ledger.retain(|(claimant, _, _)| claimant != &id);
        ledger.push((id, priority, dev.devnode.clone().unwrap_or_default()));
        ledger.sort_by(|a, b| b.1.cmp(&a.1));

        save_ledger(&ledger_path, &ledger)?;
        self.resolve_link(link, &ledger)
    }

    fn release_link(&self, dev: &Device, link: &str) -> Result<()> {
        let _lock = DirLock::acquire(&self.links_dir())?;
        let id = device_id(dev);
        let ledger_path = self.ledger_path(link);

        let mut ledger = load_ledger(&ledger_path);
        ledger.retain(|(claimant, _, _)| claimant != &id);

        if ledger.is_empty() {
            let _ = std::fs::remove_file(&ledger_path);
            unlink_path(link);
        } else {
            save_ledger(&ledger_path, &ledger)?;
            self.resolve_link(link, &ledger)?;
        }

        Ok(())
    }

    fn resolve_link(&self, link: &str, ledger: &[(String, i32, String)]) -> Result<()> {
        let Some((_, _, target)) = ledger.first() else {
            unlink_path(link);
            return Ok(());
        };

        let link_path = dev_path(link);
        if let Some(parent) = Path::new(&link_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        if let Ok(existing) = std::fs::read_link(&link_path) {
            if existing.to_string_lossy() == *target {
                return Ok(());
            }
        }

        let _ = std::fs::remove_file(&link_path);
        std::os::unix::fs::symlink(target, &link_path)?;
        debug!("resolved symlink {} -> {}", link_path, target);

        Ok(())
    }
}

fn dev_path(link: &str) -> String {
    if link.starts_with('/') {
        link.to_string()
    } else {
        format!("/dev/{}", link)
    }
}

fn unlink_path(link: &str) {
    let path = dev_path(link);
    if Path::new(&path).is_symlink() {
        let _ = std::fs::remove_file(&path);
        debug!("removed symlink: {}", path);
    }
}

fn escape_link_name(link: &str) -> String {
    link.trim_start_matches('/').replace('/', "-")
}

/// Ledger lines: `<device-id>\t<priority>\t<target-devnode>`.
fn load_ledger(path: &Path) -> Vec<(String, i32, String)> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let id = parts.next()?.to_string();
            let priority: i32 = parts.next()?.parse().ok()?;
            let target = parts.next()?.to_string();
            Some((id, priority, target))
        })
        .collect()
}

fn save_ledger(path: &Path, ledger: &[(String, i32, String)]) -> Result<()> {
    let content = ledger
        .iter()
        .map(|(id, priority, target)| format!("{}\t{}\t{}", id, priority, target))
        .collect::<Vec<_>>()
        .join("\n");
    std::fs::write(path, content)?;
    Ok(())
}

fn create_node(dev: &Device, devnode: &str, mode: u32, uid: u32, gid: u32) -> Result<()> {
    let (major, minor) = dev
        .devnum()
        .ok_or_else(|| anyhow!("no devnum for device node {}", devnode))?;

    let dev_type = if dev.subsystem.as_deref() == Some("block") {
        libc::S_IFBLK
    } else {
        libc::S_IFCHR
    };

    let devnode_c = std::ffi::CString::new(devnode)?;
    let rdev = makedev(major, minor);

    let existing = std::fs::metadata(devnode);
    let needs_create = !matches!(&existing, Ok(m) if m.rdev() == rdev);

    if needs_create {
        let result = unsafe {
            libc::unlink(devnode_c.as_ptr());
            libc::mknod(devnode_c.as_ptr(), dev_type | 0o600, rdev)
        };
        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(anyhow!("mknod {} failed: {}", devnode, err));
            }
        }
        info!("created device node: {}", devnode);
    }

    let result = unsafe { libc::chmod(devnode_c.as_ptr(), mode) };
    if result < 0 {
        warn!("chmod {} failed: {}", devnode, std::io::Error::last_os_error());
    }

    let result = unsafe { libc::chown(devnode_c.as_ptr(), uid, gid) };
    if result < 0 {
        warn!("chown {} failed: {}", devnode, std::io::Error::last_os_error());
    }

    Ok(())
}

trait MetadataExt {
    fn rdev(&self) -> u64;
}

impl MetadataExt for std::fs::Metadata {
    fn rdev(&self) -> u64 {
        use std::os::unix::fs::MetadataExt as _;
        std::os::unix::fs::MetadataExt::rdev(self)
    }
}

/// Remove `devnode` only if its current `rdev` still matches the
/// departing device's devnum — a node another device already recreated
/// at the same path (e.g. a fast remove/add churn) is left alone.
fn remove_node_if_owned(devnode: &str, devnum: Option<(u32, u32)>) -> Result<()> {
    let Some((major, minor)) = devnum else {
        return Ok(());
    };

    match std::fs::metadata(devnode) {
        Ok(m) if MetadataExt::rdev(&m) == makedev(major, minor) => {
            std::fs::remove_file(devnode)?;
            debug!("removed device node: {}", devnode);
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn makedev(major: u32, minor: u32) -> libc::dev_t {
    ((major as libc::dev_t) << 8) | (minor as libc::dev_t & 0xff) | ((minor as libc::dev_t & !0xff) << 12)
}

/// Snapshot of a ledger file, exposed for tests and introspection tools.
pub fn ledger_snapshot(state_dir: &Path, link: &str) -> Vec<(String, i32, String)> {
    let path = state_dir.join("links").join(escape_link_name(link));
    load_ledger(&path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Action;

    fn dev(sysname: &str, devnode: &str, major: u32, minor: u32) -> Device {
        let mut d = Device::bare(sysname, Action::Add);
        d.subsystem = Some("block".into());
        d.devnode = Some(devnode.into());
        d.major = Some(major);
        d.minor = Some(minor);
        d
    }

    #[test]
    fn higher_priority_claimant_wins_shared_link() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = NodeManager::new(tmp.path());

        let low = dev("sda", "/dev/sda", 8, 0);
        let high = dev("sdb", "/dev/sdb", 8, 16);

        mgr.claim_link(&low, "disk/by-id/shared", 0).unwrap();
        mgr.claim_link(&high, "disk/by-id/shared", 10).unwrap();

        let ledger = ledger_snapshot(tmp.path(), "disk/by-id/shared");
        assert_eq!(ledger[0].2, "/dev/sdb");
    }

    #[test]
    fn release_falls_back_to_next_claimant() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = NodeManager::new(tmp.path());

        let low = dev("sda", "/dev/sda", 8, 0);
        let high = dev("sdb", "/dev/sdb", 8, 16);

        mgr.claim_link(&low, "disk/by-id/shared", 0).unwrap();
        mgr.claim_link(&high, "disk/by-id/shared", 10).unwrap();
        mgr.release_link(&high, "disk/by-id/shared").unwrap();

        let ledger = ledger_snapshot(tmp.path(), "disk/by-id/shared");
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].0, device_id(&low));
    }

    #[test]
    fn repeated_claim_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = NodeManager::new(tmp.path());
        let d = dev("sda", "/dev/sda", 8, 0);

        mgr.claim_link(&d, "disk/by-id/x", 5).unwrap();
        mgr.claim_link(&d, "disk/by-id/x", 5).unwrap();

        let ledger = ledger_snapshot(tmp.path(), "disk/by-id/x");
        assert_eq!(ledger.len(), 1);
    }
}
