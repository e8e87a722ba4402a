//! Per-event state (C3) and the orchestrator (C7) that drives one device
//! event through rule matching, node/symlink management, and run-list
//! execution.
//!
//! The sequencing in [`Orchestrator::execute`] follows
//! `udev_event_execute_rules`/`udev_event_execute_run` closely: a `remove`
//! action takes the short path (read back the old record, drop tags/db/
//! watch, apply rules only to let them observe the departing device, then
//! unlink the node); every other action snapshots the prior record,
//! applies rules, renames a newly named network interface, reconciles
//! symlinks and node ownership, and finally persists the record.

use crate::builtin::BuiltinRegistry;
use crate::db::{Db, DbRecord, LinkClaim};
use crate::device::{Action, Device, DeviceDatabase};
use crate::netif::{self, RtnlHandle};
use crate::node::NodeManager;
use crate::rules::{RuleSet, RulesOutcome};
use crate::spawn::{self, SpawnJob};
use crate::watch::WatchManager;
use anyhow::Result;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// How a run-list entry should be dispatched: a builtin command (looked
/// up by its registered tag) or an external program line, subject to the
/// same format expansion either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Builtin(String),
    External,
}

/// Mutable state threaded through rule evaluation for a single event,
/// mirroring the fields `struct udev_event` carries across
/// `udev_rules_apply_to_event`.
pub struct EventContext {
    pub dev: Device,
    /// Snapshot of the device's prior db record, loaded before rules run
    /// (non-remove path only) so rules can compare old vs. new state and
    /// so stale symlinks can be reconciled afterwards.
    pub dev_db: Option<DbRecord>,
    pub birth_usec: u64,
    pub name: Option<String>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub seclabel_list: HashMap<String, String>,
    /// Run-list entries in declaration order: the format string for the
    /// command, and whether it dispatches to a builtin or external
    /// program.
    pub run_list: Vec<(String, Dispatch)>,
    pub program_result: Option<String>,
    pub exec_delay: Option<u64>,
    pub links: Vec<LinkClaim>,
    rtnl: Option<RtnlHandle>,
}

impl EventContext {
    pub fn new(dev: Device) -> Self {
        Self {
            dev,
            dev_db: None,
            birth_usec: now_usec(),
            name: None,
            mode: None,
            uid: None,
            gid: None,
            seclabel_list: HashMap::new(),
            run_list: Vec::new(),
            program_result: None,
            exec_delay: None,
            links: Vec::new(),
            rtnl: None,
        }
    }

    pub fn add_run(&mut self, command: String, dispatch: Dispatch) {
        self.run_list.push((command, dispatch));
    }
}

pub fn now_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Default device node mode when no rule and no kernel-supplied value
/// apply: 0660 if a group was assigned, else 0600.
fn default_mode(gid: Option<u32>) -> u32 {
    match gid {
        Some(g) if g > 0 => 0o660,
        _ => 0o600,
    }
}

/// Wires together the collaborators a single event needs: the rule set,
/// the persisted db, the node manager, the netif renamer, and the watch
/// manager. One instance is shared across the daemon's event loop; an
/// `EventContext` is created fresh per event.
pub struct Orchestrator {
    pub rules: RuleSet,
    pub db: Db,
    pub nodes: NodeManager,
    pub watch: WatchManager,
    pub builtins: BuiltinRegistry,
    pub timeout_usec: u64,
    pub timeout_warn_usec: u64,
}

impl Orchestrator {
    pub fn new(
        rules: RuleSet,
        db: Db,
        nodes: NodeManager,
        watch: WatchManager,
        builtins: BuiltinRegistry,
        timeout_usec: u64,
        timeout_warn_usec: u64,
    ) -> Self {
        Self {
            rules,
            db,
            nodes,
            watch,
            builtins,
            timeout_usec,
            timeout_warn_usec,
        }
    }

    /// Execute one device event end to end against `devdb`, the shared
    /// in-memory device table.
    pub async fn execute(
        &self,
        dev: Device,
        devdb: &mut DeviceDatabase,
        properties_overlay: &HashMap<String, String>,
    ) -> Result<()> {
        if dev.subsystem.is_none() {
            debug!("ignoring event for {} with no subsystem", dev.syspath);
            return Ok(());
        }

        let mut event = EventContext::new(dev);

        if event.dev.action == Action::Remove {
            self.execute_remove(&mut event, devdb, properties_overlay).await?;
        } else {
            self.execute_update(&mut event, devdb, properties_overlay).await?;
        }

        devdb.add(event.dev);
        Ok(())
    }

    async fn execute_remove(
        &self,
        event: &mut EventContext,
        devdb: &DeviceDatabase,
        properties_overlay: &HashMap<String, String>,
    ) -> Result<()> {
        let prior = self.db.read_db(&mut event.dev)?;
        self.db.tag_index(&event.dev, None, false)?;
        self.db.delete_db(&event.dev)?;

        if event.dev.has_devnode_major() {
            self.watch.end(&event.dev);
        }

        let outcome = self.rules.apply_to_event(event, devdb, properties_overlay);
        if outcome == RulesOutcome::Terminate {
            debug!("rule evaluation for {} stopped at OPTIONS=\"last_rule\"", event.dev.syspath);
        }

        if event.dev.has_devnode_major() {
            let owned_links: Vec<String> = prior
                .as_ref()
                .map(|r| r.devlinks.iter().map(|l| l.path.clone()).collect())
                .unwrap_or_default();
            self.nodes.node_remove(&event.dev, &owned_links)?;
        }

        self.run_list(event, devdb).await?;

        Ok(())
    }

    async fn execute_update(
        &self,
        event: &mut EventContext,
        devdb: &DeviceDatabase,
        properties_overlay: &HashMap<String, String>,
    ) -> Result<()> {
        let prior_record = self.db.peek(&event.dev);
        if prior_record.is_some() && event.dev.has_devnode_major() {
            self.watch.end(&event.dev);
        }

        if !event.dev.has_devnode_major() && event.dev.action == Action::Move {
            if let Some(prior) = &prior_record {
                for (k, v) in &prior.properties {
                    if event.dev.properties.get(k).is_none() {
                        event.dev.properties.insert(k.clone(), v.clone());
                    }
                }
            }
        }

        event.dev_db = prior_record;

        // `RulesOutcome::Terminate` means a rule set `OPTIONS="last_rule"` —
        // it stops further rule *evaluation* only. It is not the "skip
        // remaining event steps" cancellation distilled §5/§7 describe for a
        // `RulesError`; node apply, rename, and db write still run so the
        // device ends up in the state the rules that did match declared.
        let outcome = self.rules.apply_to_event(event, devdb, properties_overlay);
        if outcome == RulesOutcome::Terminate {
            debug!("rule evaluation for {} stopped at OPTIONS=\"last_rule\"", event.dev.syspath);
        }

        if event.dev.ifindex.map(|i| i > 0).unwrap_or(false)
            && event.dev.action == Action::Add
            && event.name.as_deref().is_some_and(|n| n != event.dev.sysname)
        {
            self.rename_interface(event);
        }

        if let Some((major, _)) = event.dev.devnum() {
            if major > 0 {
                if let Some(prior) = &event.dev_db {
                    let old_links: Vec<String> = prior.devlinks.iter().map(|l| l.path.clone()).collect();
                    let current_links: Vec<String> = event.links.iter().map(|l| l.path.clone()).collect();
                    self.nodes.update_old_links(&event.dev, &old_links, &current_links)?;
                }

                let owner_set = event.uid.is_some();
                let group_set = event.gid.is_some();
                let mode_set = event.mode.is_some();

                let uid = event.uid.unwrap_or(event.dev.kernel_uid.unwrap_or(0));
                let gid = event.gid.unwrap_or(event.dev.kernel_gid.unwrap_or(0));
                let mode = event.mode.or(event.dev.kernel_mode).unwrap_or_else(|| default_mode(Some(gid)));

                let apply = event.dev.action == Action::Add || owner_set || group_set || mode_set;

                let links: Vec<(String, i32)> = event
                    .links
                    .iter()
                    .map(|l| (l.path.clone(), l.priority))
                    .collect();
                event.links = self.nodes.node_add(&event.dev, apply, mode, uid, gid, &links)?;
            }
        }

        let usec_initialized = event
            .dev_db
            .as_ref()
            .and_then(|r| r.usec_initialized)
            .unwrap_or_else(now_usec);

        self.db.tag_index(&event.dev, event.dev_db.as_ref(), true)?;
        self.db.update_db(&event.dev, &event.links, Some(usec_initialized), true)?;

        self.run_list(event, devdb).await?;

        Ok(())
    }

    fn rename_interface(&self, event: &mut EventContext) {
        let Some(ifindex) = event.dev.ifindex else { return };
        let Some(new_name) = event.name.clone() else { return };
        let old_name = event.dev.sysname.clone();

        match netif::rename_netif(&mut event.rtnl, ifindex, &old_name, &new_name) {
            Ok(()) => {
                event.dev.sysname = new_name.clone();
                event.dev.devpath = event
                    .dev
                    .devpath
                    .rsplit_once('/')
                    .map(|(prefix, _)| format!("{}/{}", prefix, new_name))
                    .unwrap_or(new_name);
                debug!("changed devpath to '{}'", event.dev.devpath);
            }
            Err(e) => {
                warn!(
                    "could not rename interface {} from '{}' to '{}': {}",
                    ifindex, old_name, new_name, e
                );
            }
        }
    }

    /// Execute `event.run_list` in declaration order (C4.4), expanding
    /// each command's format string first.
    async fn run_list(&self, event: &mut EventContext, devdb: &DeviceDatabase) -> Result<()> {
        let entries = event.run_list.clone();

        for (template, dispatch) in entries {
            let command = crate::format::expand(event, devdb, &template, 2048, false);

            match dispatch {
                Dispatch::Builtin(tag) => {
                    self.builtins.run(&tag, &mut event.dev, &command, false);
                }
                Dispatch::External => {
                    if let Some(delay) = event.exec_delay {
                        if delay > 0 {
                            debug!("delaying execution of '{}' by {}s", command, delay);
                            tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                        }
                    }

                    let job = SpawnJob::from_command_line(&command, &event.dev, event.birth_usec);
                    match job {
                        Ok(job) => {
                            let result = spawn::run(job, self.timeout_usec, self.timeout_warn_usec).await;
                            if let Ok(output) = result {
                                event.program_result = Some(output);
                            }
                        }
                        Err(e) => warn!("failed to build spawn job for '{}': {}", command, e),
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Action;

    #[test]
    fn default_mode_uses_0660_when_group_assigned() {
        assert_eq!(default_mode(Some(100)), 0o660);
        assert_eq!(default_mode(Some(0)), 0o600);
        assert_eq!(default_mode(None), 0o600);
    }

    #[test]
    fn new_context_has_no_prior_record() {
        let dev = Device::bare("sda", Action::Add);
        let ctx = EventContext::new(dev);
        assert!(ctx.dev_db.is_none());
        assert!(ctx.run_list.is_empty());
    }
}
