//! Format-string substitution (`$name` / `%c`-style tokens) against a
//! device and event.
//!
//! Grounded in `udev_event_apply_format`/`subst_format_var` from the
//! upstream C implementation this crate's rule engine was distilled from:
//! a closed token table, a scanner that falls through to literal-copy on
//! anything that doesn't match a token, and a destination capacity that is
//! never exceeded.

use crate::device::{Device, DeviceDatabase};
use crate::event::EventContext;
use tracing::error;

/// One row of the token table: long name, short form, and the value it
/// produces. The table is closed — this is not a general template engine.
struct Token {
    name: &'static str,
    short: char,
    kind: TokenKind,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    DevNode,
    Attr,
    Env,
    Kernel,
    Number,
    Driver,
    DevPath,
    Id,
    Major,
    Minor,
    Result,
    Parent,
    Name,
    Links,
    Root,
    Sys,
}

const TOKENS: &[Token] = &[
    Token { name: "devnode", short: 'N', kind: TokenKind::DevNode },
    Token { name: "tempnode", short: 'N', kind: TokenKind::DevNode },
    Token { name: "attr", short: 's', kind: TokenKind::Attr },
    Token { name: "sysfs", short: 's', kind: TokenKind::Attr },
    Token { name: "env", short: 'E', kind: TokenKind::Env },
    Token { name: "kernel", short: 'k', kind: TokenKind::Kernel },
    Token { name: "number", short: 'n', kind: TokenKind::Number },
    Token { name: "driver", short: 'd', kind: TokenKind::Driver },
    Token { name: "devpath", short: 'p', kind: TokenKind::DevPath },
    Token { name: "id", short: 'b', kind: TokenKind::Id },
    Token { name: "major", short: 'M', kind: TokenKind::Major },
    Token { name: "minor", short: 'm', kind: TokenKind::Minor },
    Token { name: "result", short: 'c', kind: TokenKind::Result },
    Token { name: "parent", short: 'P', kind: TokenKind::Parent },
    Token { name: "name", short: 'D', kind: TokenKind::Name },
    Token { name: "links", short: 'L', kind: TokenKind::Links },
    Token { name: "root", short: 'r', kind: TokenKind::Root },
    Token { name: "sys", short: 'S', kind: TokenKind::Sys },
];

const ALLOWED_ATTR_CHARS: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_-.:/";

/// Expand `src` against `event`/`db`, writing at most `capacity - 1` bytes
/// of content plus a trailing NUL equivalent (the return value is a plain
/// `String`, which is already never longer than what was written — the
/// capacity ceiling below is the Rust-shaped stand-in for the C
/// destination buffer's reserved terminator byte).
///
/// Returns the expanded string, truncated to `capacity` bytes if needed.
pub fn expand(
    event: &EventContext,
    db: &DeviceDatabase,
    src: &str,
    capacity: usize,
    replace_whitespace: bool,
) -> String {
    let cap = capacity.saturating_sub(1);
    let mut out = String::new();
    let bytes = src.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let remaining_cap = cap.saturating_sub(out.len());
        if remaining_cap == 0 {
            break;
        }

        let c = bytes[i];

        if c == b'$' || c == b'%' {
            if bytes.get(i + 1) == Some(&c) {
                out.push(c as char);
                i += 2;
                continue;
            }

            let matched = if c == b'$' {
                match_long(&src[i + 1..])
            } else {
                bytes.get(i + 1).and_then(|&b| match_short(b as char))
            };

            if let Some((token, consumed)) = matched {
                let mut j = i + 1 + consumed;
                let mut arg: Option<String> = None;

                if bytes.get(j) == Some(&b'{') {
                    match find_closing_brace(src, j + 1) {
                        Some(end) => {
                            arg = Some(src[j + 1..end].to_string());
                            j = end + 1;
                        }
                        None => {
                            error!("missing closing brace for format '{}'", src);
                            break;
                        }
                    }
                }

                i = j;

                let mut value = resolve(event, db, token.kind, arg.as_deref());
                if replace_whitespace && token.kind != TokenKind::Result {
                    value = collapse_whitespace(&value);
                }

                let room = cap.saturating_sub(out.len());
                push_truncated(&mut out, &value, room);
                continue;
            }
        }

        // Fallthrough: literal copy of one (UTF-8) character, matching the
        // C scanner's `goto copy` when no token matched.
        let ch_len = utf8_char_len(bytes[i]);
        let end = (i + ch_len).min(bytes.len());
        if let Ok(s) = std::str::from_utf8(&bytes[i..end]) {
            push_truncated(&mut out, s, cap.saturating_sub(out.len()));
        }
        i = end;
    }

    out
}

fn utf8_char_len(first_byte: u8) -> usize {
    if first_byte & 0x80 == 0 {
        1
    } else if first_byte & 0xE0 == 0xC0 {
        2
    } else if first_byte & 0xF0 == 0xE0 {
        3
    } else if first_byte & 0xF8 == 0xF0 {
        4
    } else {
        1
    }
}

fn push_truncated(out: &mut String, value: &str, room: usize) {
    if room == 0 {
        return;
    }
    if value.len() <= room {
        out.push_str(value);
        return;
    }
    // Truncate at the last full char boundary that fits.
    let mut end = room;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    out.push_str(&value[..end]);
}

fn match_long(rest: &str) -> Option<(&'static Token, usize)> {
    TOKENS
        .iter()
        .filter(|t| rest.starts_with(t.name))
        .max_by_key(|t| t.name.len())
        .map(|t| (t, t.name.len()))
}

fn match_short(c: char) -> Option<(&'static Token, usize)> {
    TOKENS.iter().find(|t| t.short == c).map(|t| (t, 1))
}

fn find_closing_brace(src: &str, start: usize) -> Option<usize> {
    let bytes = src.as_bytes();
    let mut i = start;
    while i < bytes.len() {
        if bytes[i] == b'}' {
            return Some(i);
        }
        if bytes[i] == b'{' {
            // Nesting is not permitted; treat as an unterminated brace.
            return None;
        }
        i += 1;
    }
    None
}

/// Collapse runs of whitespace to a single `_`.
fn collapse_whitespace(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_ws = false;
    for c in value.chars() {
        if c.is_whitespace() {
            if !in_ws {
                out.push('_');
                in_ws = true;
            }
        } else {
            out.push(c);
            in_ws = false;
        }
    }
    out
}

fn sanitize_attr(value: &str) -> String {
    value
        .trim_end()
        .chars()
        .map(|c| if ALLOWED_ATTR_CHARS.contains(c) { c } else { '_' })
        .collect()
}

fn resolve(
    event: &EventContext,
    db: &DeviceDatabase,
    kind: TokenKind,
    arg: Option<&str>,
) -> String {
    let dev = &event.dev;

    match kind {
        TokenKind::DevNode => dev.devnode.clone().unwrap_or_default(),
        TokenKind::DevPath => dev.devpath.clone(),
        TokenKind::Kernel => dev.sysname.clone(),
        TokenKind::Number => dev.sysnum.clone().unwrap_or_default(),
        TokenKind::Id => db
            .parent_of(dev)
            .map(|p| p.sysname.clone())
            .unwrap_or_default(),
        TokenKind::Driver => db
            .parent_of(dev)
            .and_then(|p| p.driver.clone())
            .unwrap_or_default(),
        TokenKind::Major => dev.major.map(|m| m.to_string()).unwrap_or_default(),
        TokenKind::Minor => dev.minor.map(|m| m.to_string()).unwrap_or_default(),
        TokenKind::Result => resolve_result(event, arg),
        TokenKind::Attr => resolve_attr(event, db, arg),
        TokenKind::Env => arg
            .and_then(|name| dev.property(name))
            .unwrap_or_default()
            .to_string(),
        TokenKind::Parent => db
            .parent_of(dev)
            .and_then(|p| p.devnode.as_deref())
            .map(|n| n.strip_prefix("/dev/").unwrap_or(n).to_string())
            .unwrap_or_default(),
        TokenKind::Name => {
            if let Some(name) = &event.name {
                name.clone()
            } else if let Some(node) = &dev.devnode {
                node.strip_prefix("/dev/").unwrap_or(node).to_string()
            } else {
                dev.sysname.clone()
            }
        }
        TokenKind::Links => dev
            .devlinks
            .iter()
            .map(|l| l.strip_prefix("/dev/").unwrap_or(l))
            .collect::<Vec<_>>()
            .join(" "),
        TokenKind::Root => "/dev".to_string(),
        TokenKind::Sys => "/sys".to_string(),
    }
}

fn resolve_attr(event: &EventContext, db: &DeviceDatabase, arg: Option<&str>) -> String {
    let Some(attr) = arg else {
        error!("missing file parameter for attr");
        return String::new();
    };

    let value = if let Some(resolved) = resolve_subsys_kernel(attr) {
        Some(resolved)
    } else if let Some(v) = event.dev.sysattr_read(attr) {
        Some(v)
    } else {
        db.parent_of(&event.dev).and_then(|p| p.sysattr_read(attr))
    };

    match value {
        Some(v) => sanitize_attr(&v),
        None => String::new(),
    }
}

/// Resolves a `[subsystem/kernel]attr`-style argument by walking the
/// sysfs subsystem symlink tree, mirroring `util_resolve_subsys_kernel`.
fn resolve_subsys_kernel(attr: &str) -> Option<String> {
    let rest = attr.strip_prefix('[')?;
    let (inner, attrname) = rest.split_once(']')?;
    let (subsystem, kernel) = inner.split_once('/')?;

    let path = std::path::Path::new("/sys/subsystem")
        .join(subsystem)
        .join("devices")
        .join(kernel)
        .join(attrname);

    let alt = std::path::Path::new("/sys/class")
        .join(subsystem)
        .join(kernel)
        .join(attrname);

    std::fs::read_to_string(&path)
        .or_else(|_| std::fs::read_to_string(&alt))
        .ok()
        .map(|s| s.trim().to_string())
}

/// `result` part-splitting: 1-indexed whitespace-delimited parts, `N`
/// selects one, `N+` selects from the N-th part to the end (preserving
/// original internal spacing). `replace_whitespace` never touches this
/// token, per the upstream source.
fn resolve_result(event: &EventContext, arg: Option<&str>) -> String {
    let Some(result) = &event.program_result else {
        return String::new();
    };

    let Some(arg) = arg else {
        return result.clone();
    };

    let (num_str, plus) = if let Some(stripped) = arg.strip_suffix('+') {
        (stripped, true)
    } else {
        (arg, false)
    };

    let n: usize = match num_str.parse() {
        Ok(n) if n > 0 => n,
        _ => return result.clone(),
    };

    // Find the byte offset of the start of the n-th whitespace-delimited part.
    let mut starts = Vec::new();
    let mut prev_was_ws = true;
    for (idx, ch) in result.char_indices() {
        let is_ws = ch.is_whitespace();
        if !is_ws && prev_was_ws {
            starts.push(idx);
        }
        prev_was_ws = is_ws;
    }

    let Some(&start) = starts.get(n - 1) else {
        error!("requested part of result string not found");
        return String::new();
    };

    if plus {
        result[start..].to_string()
    } else {
        let rest = &result[start..];
        match rest.find(char::is_whitespace) {
            Some(end) => rest[..end].to_string(),
            None => rest.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Action;

    fn ctx_with_result(result: &str) -> (EventContext, DeviceDatabase) {
        let dev = Device::bare("sda", Action::Add);
        let mut event = EventContext::new(dev);
        event.program_result = Some(result.to_string());
        (event, DeviceDatabase::new())
    }

    #[test]
    fn result_parts_split_and_preserve_tail_spacing() {
        let (event, db) = ctx_with_result("alpha beta  gamma delta");
        let out = expand(&event, &db, "%c{2} %c{3+}", 256, true);
        assert_eq!(out, "beta gamma delta");
    }

    #[test]
    fn result_out_of_range_logs_and_emits_nothing() {
        let (event, db) = ctx_with_result("alpha");
        let out = expand(&event, &db, "%c{5}", 256, true);
        assert_eq!(out, "");
    }

    #[test]
    fn dollar_dollar_and_percent_percent_are_literal() {
        let dev = Device::bare("sda", Action::Add);
        let event = EventContext::new(dev);
        let db = DeviceDatabase::new();
        assert_eq!(expand(&event, &db, "$$HOME", 256, false), "$HOME");
        assert_eq!(expand(&event, &db, "100%%", 256, false), "100%");
    }

    #[test]
    fn short_and_long_forms_match() {
        let dev = Device::bare("sda1", Action::Add);
        let event = EventContext::new(dev);
        let db = DeviceDatabase::new();
        assert_eq!(expand(&event, &db, "$kernel", 256, false), "sda1");
        assert_eq!(expand(&event, &db, "%k", 256, false), "sda1");
    }

    #[test]
    fn overflow_truncates_and_still_nul_budgets() {
        let dev = Device::bare("sda1", Action::Add);
        let event = EventContext::new(dev);
        let db = DeviceDatabase::new();
        let out = expand(&event, &db, "$kernel", 3, false);
        assert_eq!(out, "sd");
        assert!(out.len() < 3);
    }

    #[test]
    fn unknown_token_is_literal_text_not_swallowed() {
        let dev = Device::bare("sda1", Action::Add);
        let event = EventContext::new(dev);
        let db = DeviceDatabase::new();
        // "$bogus" does not match any token name, so it is copied literally.
        assert_eq!(expand(&event, &db, "$bogus", 256, false), "$bogus");
    }

    #[test]
    fn missing_closing_brace_truncates_output() {
        let dev = Device::bare("sda1", Action::Add);
        let event = EventContext::new(dev);
        let db = DeviceDatabase::new();
        // The unterminated `{` aborts expansion at the point the token
        // started; text already emitted before it is kept.
        assert_eq!(expand(&event, &db, "pre$kernel{oops", 256, false), "pre");
    }

    #[test]
    fn whitespace_replacement_collapses_to_underscore() {
        assert_eq!(collapse_whitespace("Samsung SSD 840\n"), "Samsung_SSD_840_");
        assert_eq!(collapse_whitespace("Samsung SSD 840"), "Samsung_SSD_840");
    }

    #[test]
    fn attr_sanitizes_trailing_whitespace_and_spaces() {
        assert_eq!(sanitize_attr("Samsung SSD 840\n"), "Samsung_SSD_840");
    }
}
