//! Device node watch bookkeeping (I2).
//!
//! While an event is being processed the node's inotify watch is
//! suspended (`end`) so a rule-triggered open/close on the node itself
//! doesn't re-trigger processing, then re-armed (`begin`) once the event
//! has finished and the node's final identity is known. One inotify
//! instance is shared across all watched nodes; each watch descriptor is
//! tracked by devnode so `end` can look it up without the caller holding
//! on to it.

use inotify::{Inotify, WatchMask};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::device::Device;

pub struct WatchManager {
    inotify: Mutex<Inotify>,
    watches: Mutex<HashMap<String, inotify::WatchDescriptor>>,
}

impl WatchManager {
    pub fn new() -> anyhow::Result<Self> {
        let inotify = Inotify::init()?;
        Ok(Self {
            inotify: Mutex::new(inotify),
            watches: Mutex::new(HashMap::new()),
        })
    }

    /// Arm a watch on `dev.devnode`, replacing any prior watch for the
    /// same path.
    pub fn begin(&self, dev: &Device) {
        let Some(devnode) = &dev.devnode else { return };

        let mut inotify = self.inotify.lock().unwrap();
        match inotify.watches().add(devnode, WatchMask::CLOSE_WRITE | WatchMask::IGNORED) {
            Ok(wd) => {
                self.watches.lock().unwrap().insert(devnode.clone(), wd);
                debug!("armed watch on {}", devnode);
            }
            Err(e) => warn!("failed to watch {}: {}", devnode, e),
        }
    }

    /// Suspend the watch on `dev.devnode`, if one is active.
    pub fn end(&self, dev: &Device) {
        let Some(devnode) = &dev.devnode else { return };

        let wd = self.watches.lock().unwrap().remove(devnode);
        if let Some(wd) = wd {
            let mut inotify = self.inotify.lock().unwrap();
            if let Err(e) = inotify.watches().remove(wd) {
                debug!("watch on {} already gone: {}", devnode, e);
            } else {
                debug!("suspended watch on {}", devnode);
            }
        }
    }

    pub fn is_watched(&self, devnode: &str) -> bool {
        self.watches.lock().unwrap().contains_key(devnode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Action;

    #[test]
    fn begin_and_end_on_missing_devnode_is_a_noop() {
        let mgr = WatchManager::new().unwrap();
        let dev = Device::bare("sda", Action::Add);
        mgr.begin(&dev);
        mgr.end(&dev);
        assert!(!mgr.is_watched("/dev/sda"));
    }
}
