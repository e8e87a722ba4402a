//! Rule parsing and evaluation (C4), generalizing the prior rule
//! matcher to write its effects into an [`EventContext`] rather than
//! acting immediately, and adding the pieces rule evaluation in
//! `udev_rules_apply_to_event` actually needs: parent-attribute lookup,
//! negative (`!=`) conditions, `GOTO`/`LABEL`, symlink priority, and
//! RUN entries tagged by dispatch kind (builtin vs external).

use crate::device::{Device, DeviceDatabase};
use crate::event::{Dispatch, EventContext};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulesOutcome {
    Continue,
    Terminate,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: Option<String>,
    pub label: Option<String>,
    pub goto: Option<String>,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
    pub priority: i32,
}

#[derive(Debug, Clone)]
pub enum RuleCondition {
    Subsystem(String, bool),
    Kernel(String, bool),
    Driver(String, bool),
    DevType(String, bool),
    Attr(String, String, bool),
    ParentAttr(String, String),
    Property(String, String, bool),
    Tag(String, bool),
    Action(String),
}

#[derive(Debug, Clone)]
pub enum RuleAction {
    Name(String),
    Symlink(String, i32),
    Mode(u32),
    Owner(String),
    Group(String),
    Run(String, Option<String>),
    Tag(String),
    Env(String, String),
    Label(String),
    Goto(String),
    Last,
}

impl Rule {
    fn matches(&self, dev: &Device, devdb: &DeviceDatabase) -> bool {
        self.conditions.iter().all(|c| c.matches(dev, devdb))
    }
}

impl RuleCondition {
    fn matches(&self, dev: &Device, devdb: &DeviceDatabase) -> bool {
        match self {
            RuleCondition::Subsystem(pattern, negate) => {
                let m = dev.subsystem.as_deref().map(|s| pattern_match(s, pattern)).unwrap_or(false);
                m != *negate
            }
            RuleCondition::Kernel(pattern, negate) => pattern_match(&dev.sysname, pattern) != *negate,
            RuleCondition::Driver(pattern, negate) => {
                let m = dev.driver.as_deref().map(|d| pattern_match(d, pattern)).unwrap_or(false);
                m != *negate
            }
            RuleCondition::DevType(pattern, negate) => {
                let m = dev.devtype.as_deref().map(|t| pattern_match(t, pattern)).unwrap_or(false);
                m != *negate
            }
            RuleCondition::Attr(key, pattern, negate) => {
                let m = dev.sysattr_read(key).map(|v| pattern_match(v.trim(), pattern)).unwrap_or(false);
                m != *negate
            }
            RuleCondition::ParentAttr(key, pattern) => devdb
                .parent_of(dev)
                .and_then(|p| p.sysattr_read(key))
                .map(|v| pattern_match(v.trim(), pattern))
                .unwrap_or(false),
            RuleCondition::Property(key, pattern, negate) => {
                let m = dev.property(key).map(|v| pattern_match(v, pattern)).unwrap_or(false);
                m != *negate
            }
            RuleCondition::Tag(tag, negate) => dev.has_tag(tag) != *negate,
            RuleCondition::Action(pattern) => pattern_match(dev.action.as_str(), pattern),
        }
    }
}

pub struct RuleSet {
    rules: Vec<Rule>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleSet {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn load_directory(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }

        let mut files: Vec<_> = std::fs::read_dir(path)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("rules"))
            .collect();
        files.sort_by_key(|e| e.file_name());

        for entry in files {
            if let Err(e) = self.load_file(&entry.path()) {
                warn!("failed to load {:?}: {}", entry.path(), e);
            }
        }

        info!("loaded {} rules from {:?}", self.rules.len(), path);
        Ok(())
    }

    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let priority: i32 = filename.split('-').next().and_then(|s| s.parse().ok()).unwrap_or(50);

        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match parse_rule(line, priority) {
                Ok(rule) => self.rules.push(rule),
                Err(e) => warn!("parse error in {}:{}: {}", filename, line_num + 1, e),
            }
        }

        Ok(())
    }

    pub fn add(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Evaluate every rule whose conditions match, in file order,
    /// writing effects into `event`. `GOTO`/`LABEL` skip forward to a
    /// label without re-testing intervening rules' conditions; `LAST`
    /// stops evaluation immediately. `properties_overlay` carries
    /// command-line `-p`-style property overrides applied before
    /// `ENV{}` conditions are tested.
    pub fn apply_to_event(
        &self,
        event: &mut EventContext,
        devdb: &DeviceDatabase,
        properties_overlay: &HashMap<String, String>,
    ) -> RulesOutcome {
        for (k, v) in properties_overlay {
            event.dev.properties.insert(k.clone(), v.clone());
        }

        let mut i = 0;
        while i < self.rules.len() {
            let rule = &self.rules[i];

            if !rule.matches(&event.dev, devdb) {
                i += 1;
                continue;
            }

            let mut jump = None;
            let mut last = false;

            for action in &rule.actions {
                match action {
                    RuleAction::Name(name) => event.name = Some(name.clone()),
                    RuleAction::Symlink(link, priority) => {
                        event.links.push(crate::db::LinkClaim { path: link.clone(), priority: *priority })
                    }
                    RuleAction::Mode(mode) => event.mode = Some(*mode),
                    RuleAction::Owner(owner) => {
                        if let Ok(uid) = owner.parse() {
                            event.uid = Some(uid);
                        }
                    }
                    RuleAction::Group(group) => {
                        if let Ok(gid) = group.parse() {
                            event.gid = Some(gid);
                        }
                    }
                    RuleAction::Run(cmd, builtin_tag) => {
                        let dispatch = match builtin_tag {
                            Some(tag) => Dispatch::Builtin(tag.clone()),
                            None => Dispatch::External,
                        };
                        event.add_run(cmd.clone(), dispatch);
                    }
                    RuleAction::Tag(tag) => event.dev.add_tag(tag),
                    RuleAction::Env(key, value) => {
                        event.dev.properties.insert(key.clone(), value.clone());
                    }
                    RuleAction::Label(_) => {}
                    RuleAction::Goto(label) => jump = Some(label.clone()),
                    RuleAction::Last => last = true,
                }
            }

            if let Some(label) = jump {
                match self.rules.iter().position(|r| r.label.as_deref() == Some(label.as_str())) {
                    Some(pos) => {
                        i = pos;
                        continue;
                    }
                    None => {
                        warn!("GOTO target label '{}' not found", label);
                    }
                }
            }

            if last {
                debug!("rule requested LAST, stopping evaluation");
                return RulesOutcome::Terminate;
            }

            i += 1;
        }

        RulesOutcome::Continue
    }
}

fn parse_rule(line: &str, priority: i32) -> Result<Rule> {
    let mut conditions = Vec::new();
    let mut actions = Vec::new();
    let mut label = None;

    for part in line.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some((key, value)) = part.split_once("!=") {
            conditions.push(parse_condition(key.trim(), unquote(value.trim()), true)?);
        } else if let Some((key, value)) = part.split_once("==") {
            conditions.push(parse_condition(key.trim(), unquote(value.trim()), false)?);
        } else if let Some((key, value)) = part.split_once("+=") {
            let action = parse_action(key.trim(), unquote(value.trim()))?;
            if let RuleAction::Label(l) = &action {
                label = Some(l.clone());
            }
            actions.push(action);
        } else if let Some((key, value)) = part.split_once('=') {
            let action = parse_action(key.trim(), unquote(value.trim()))?;
            if let RuleAction::Label(l) = &action {
                label = Some(l.clone());
            }
            actions.push(action);
        } else {
            return Err(anyhow!("unrecognized rule clause: {}", part));
        }
    }

    if conditions.is_empty() && actions.is_empty() {
        return Err(anyhow!("empty rule"));
    }

    let goto = actions.iter().find_map(|a| match a {
        RuleAction::Goto(l) => Some(l.clone()),
        _ => None,
    });

    Ok(Rule { name: None, label, goto, conditions, actions, priority })
}

fn unquote(value: &str) -> &str {
    value.trim_matches('"')
}

fn parse_condition(key: &str, value: &str, negate: bool) -> Result<RuleCondition> {
    let condition = match key.to_uppercase().as_str() {
        "SUBSYSTEM" => RuleCondition::Subsystem(value.to_string(), negate),
        "KERNEL" => RuleCondition::Kernel(value.to_string(), negate),
        "DRIVER" => RuleCondition::Driver(value.to_string(), negate),
        "DEVTYPE" => RuleCondition::DevType(value.to_string(), negate),
        "ACTION" => RuleCondition::Action(value.to_string()),
        "TAG" => RuleCondition::Tag(value.to_string(), negate),
        key if key.starts_with("ATTR{") => {
            let attr = braced(key, "ATTR")?;
            RuleCondition::Attr(attr, value.to_string(), negate)
        }
        key if key.starts_with("ATTRS{") => {
            let attr = braced(key, "ATTRS")?;
            RuleCondition::ParentAttr(attr, value.to_string())
        }
        key if key.starts_with("ENV{") => {
            let env = braced(key, "ENV")?;
            RuleCondition::Property(env, value.to_string(), negate)
        }
        _ => return Err(anyhow!("unknown condition key: {}", key)),
    };
    Ok(condition)
}

fn parse_action(key: &str, value: &str) -> Result<RuleAction> {
    let action = match key.to_uppercase().as_str() {
        "NAME" => RuleAction::Name(value.to_string()),
        "SYMLINK" => RuleAction::Symlink(value.to_string(), 0),
        "MODE" => RuleAction::Mode(u32::from_str_radix(value, 8).map_err(|_| anyhow!("invalid mode: {}", value))?),
        "OWNER" => RuleAction::Owner(value.to_string()),
        "GROUP" => RuleAction::Group(value.to_string()),
        "RUN" => RuleAction::Run(value.to_string(), None),
        "TAG" => RuleAction::Tag(value.to_string()),
        "LABEL" => RuleAction::Label(value.to_string()),
        "GOTO" => RuleAction::Goto(value.to_string()),
        "OPTIONS" if value == "last_rule" => RuleAction::Last,
        key if key.starts_with("RUN{") => {
            let tag = braced(key, "RUN")?;
            RuleAction::Run(value.to_string(), Some(tag))
        }
        key if key.starts_with("SYMLINK{") => {
            let priority: i32 = braced(key, "SYMLINK")?.parse().unwrap_or(0);
            RuleAction::Symlink(value.to_string(), priority)
        }
        key if key.starts_with("ENV{") => {
            let env = braced(key, "ENV")?;
            RuleAction::Env(env, value.to_string())
        }
        _ => return Err(anyhow!("unknown action key: {}", key)),
    };
    Ok(action)
}

fn braced(key: &str, prefix: &str) -> Result<String> {
    key.strip_prefix(prefix)
        .and_then(|s| s.strip_prefix('{'))
        .and_then(|s| s.strip_suffix('}'))
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("invalid {}{{...}} syntax", prefix))
}

/// Rule value matching uses shell-glob semantics (`*`, `?`, `[...]`),
/// same as upstream's `fnmatch`-based matcher. `glob::Pattern` implements
/// that directly; a pattern the crate rejects (unbalanced `[`) falls back
/// to a literal equality check rather than erroring out a whole rule
/// file over one bad line.
fn pattern_match(value: &str, pattern: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(value),
        Err(_) => value == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Action;

    #[test]
    fn pattern_match_supports_glob_and_question_mark() {
        assert!(pattern_match("sda", "*"));
        assert!(pattern_match("sda1", "sda*"));
        assert!(pattern_match("sda1", "sd?1"));
        assert!(!pattern_match("sdb", "sda*"));
    }

    #[test]
    fn parse_rule_splits_conditions_and_actions() {
        let rule = parse_rule(r#"SUBSYSTEM=="block", KERNEL=="sd*", MODE="0660", GROUP="disk""#, 50).unwrap();
        assert_eq!(rule.conditions.len(), 2);
        assert_eq!(rule.actions.len(), 2);
    }

    #[test]
    fn negated_condition_flips_match() {
        let rule = parse_rule(r#"SUBSYSTEM!="block", NAME="keep""#, 50).unwrap();
        let mut dev = Device::bare("eth0", Action::Add);
        dev.subsystem = Some("net".into());
        let devdb = DeviceDatabase::new();
        assert!(rule.matches(&dev, &devdb));
    }

    #[test]
    fn symlink_action_records_priority() {
        let mut set = RuleSet::new();
        set.add(parse_rule(r#"KERNEL=="sda", SYMLINK{20}="disk/by-id/x""#, 50).unwrap());

        let dev = Device::bare("sda", Action::Add);
        let mut event = EventContext::new(dev);
        let devdb = DeviceDatabase::new();
        set.apply_to_event(&mut event, &devdb, &HashMap::new());

        assert_eq!(event.links[0].path, "disk/by-id/x");
        assert_eq!(event.links[0].priority, 20);
    }

    #[test]
    fn last_rule_terminates_evaluation() {
        let mut set = RuleSet::new();
        set.add(parse_rule(r#"KERNEL=="sda", OPTIONS="last_rule""#, 10).unwrap());
        set.add(parse_rule(r#"KERNEL=="sda", NAME="should-not-apply""#, 20).unwrap());

        let dev = Device::bare("sda", Action::Add);
        let mut event = EventContext::new(dev);
        let devdb = DeviceDatabase::new();
        let outcome = set.apply_to_event(&mut event, &devdb, &HashMap::new());

        assert_eq!(outcome, RulesOutcome::Terminate);
        assert!(event.name.is_none());
    }

    #[test]
    fn run_with_builtin_tag_dispatches_as_builtin() {
        let mut set = RuleSet::new();
        set.add(parse_rule(r#"KERNEL=="sda", RUN{builtin}="hwdb""#, 50).unwrap());

        let dev = Device::bare("sda", Action::Add);
        let mut event = EventContext::new(dev);
        let devdb = DeviceDatabase::new();
        set.apply_to_event(&mut event, &devdb, &HashMap::new());

        assert_eq!(event.run_list[0].1, Dispatch::Builtin("hwdb".to_string()));
    }
}
