//! Supervised subprocess execution (C2).
//!
//! `udev_event_spawn` forks, dup2's pipes over stdout/stderr, and runs an
//! `sd-event` loop multiplexing pipe IO, a warn timer, a kill timer, and
//! SIGCHLD. `tokio::process::Command` plus `tokio::select!` is the
//! idiomatic async stand-in for that loop: no raw fork/exec, but the same
//! timers-race-IO-races-exit shape.

use crate::device::Device;
use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Programs not given as an absolute path are resolved against this
/// directory, mirroring `UDEVLIBEXECDIR` in upstream.
const LIBEXEC_DIR: &str = "/usr/lib/phantom";

/// Bound on captured stdout, mirroring the fixed `result` buffer upstream
/// — output beyond this is silently dropped, not an error.
const RESULT_CAPACITY: usize = 4096;

pub struct SpawnJob {
    pub cmd_display: String,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub event_birth_usec: u64,
    pub accept_failure: bool,
}

impl SpawnJob {
    pub fn from_command_line(cmd: &str, dev: &Device, event_birth_usec: u64) -> Result<Self> {
        let argv = tokenize(cmd);
        if argv.is_empty() {
            bail!("empty command line");
        }

        let mut argv = argv;
        if !Path::new(&argv[0]).is_absolute() {
            argv[0] = format!("{}/{}", LIBEXEC_DIR, argv[0]);
        }

        let env = dev
            .properties
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Ok(Self {
            cmd_display: cmd.to_string(),
            argv,
            env,
            event_birth_usec,
            accept_failure: false,
        })
    }
}

/// Relaxed shell-like tokenizer: splits on whitespace, honors single and
/// double quotes, does not fail on an unterminated quote (it just takes
/// the rest of the line as the final token), matching `SPLIT_QUOTES|
/// SPLIT_RELAX` upstream. A backslash escapes the next byte literally,
/// regardless of quote state, so it never ends a token, closes a quote,
/// or counts as whitespace.
fn tokenize(cmd: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = cmd.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                current.push(escaped);
                in_token = true;
            }
            continue;
        }

        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                    in_token = true;
                } else if c.is_whitespace() {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                } else {
                    current.push(c);
                    in_token = true;
                }
            }
        }
    }
    if in_token {
        tokens.push(current);
    }

    tokens
}

/// Run `job` to completion, enforcing `timeout_usec`/`timeout_warn_usec`
/// relative to `job.event_birth_usec` (time already spent in rule
/// processing is subtracted, same as upstream's `age_usec` adjustment).
/// Returns captured stdout (best-effort, truncated, never an error by
/// itself) unless the process fails and `accept_failure` is false.
pub async fn run(job: SpawnJob, timeout_usec: u64, timeout_warn_usec: u64) -> Result<String> {
    // Stdout always feeds `result`, so it is always piped. Stderr only
    // exists for logging, so skip the pipe (and the per-line log calls)
    // entirely when nothing would read it, matching upstream's
    // `log_get_max_level() >= LOG_INFO` gate on the stderr pipe.
    let capture_stderr = tracing::enabled!(tracing::Level::INFO);

    let mut command = Command::new(&job.argv[0]);
    command
        .args(&job.argv[1..])
        .env_clear()
        .envs(job.env.iter().cloned())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(if capture_stderr { Stdio::piped() } else { Stdio::null() });

    debug!("starting '{}'", job.cmd_display);

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn '{}'", job.cmd_display))?;

    let mut stdout = child.stdout.take().ok_or_else(|| anyhow!("no stdout pipe"))?;
    let mut stdout_log_buf = String::new();
    let mut read_buf = [0u8; 4096];
    let mut stderr_lines = child.stderr.take().map(|s| BufReader::new(s).lines());

    let now = Instant::now();
    let age_usec = crate::event::now_usec().saturating_sub(job.event_birth_usec);

    // Both deadlines are relative to event birth; time already spent before
    // the spawn started (rule processing, prior run-list entries) is
    // subtracted. A timeout that has already elapsed fires immediately
    // rather than being dropped, per the kill timer's "treat as immediate
    // timeout" rule; the warn timer is dropped instead, since warning about
    // an already-expired deadline is not actionable.
    let kill_deadline = Some(if timeout_usec > age_usec {
        now + Duration::from_micros(timeout_usec - age_usec)
    } else {
        now
    });
    let warn_deadline = (timeout_warn_usec > 0 && timeout_warn_usec < timeout_usec && timeout_warn_usec > age_usec)
        .then(|| now + Duration::from_micros(timeout_warn_usec - age_usec));

    let mut warned = false;
    let mut result = String::new();
    let mut stdout_done = false;
    let mut stderr_done = stderr_lines.is_none();

    loop {
        let kill_sleep = async {
            match kill_deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending().await,
            }
        };
        let warn_sleep = async {
            match (warned, warn_deadline) {
                (false, Some(d)) => tokio::time::sleep_until(d).await,
                _ => std::future::pending().await,
            }
        };

        tokio::select! {
            status = child.wait() => {
                let status = status.context("failed to wait for spawned process")?;
                drain_remaining(&mut stdout, &mut result, &mut stdout_log_buf, &job.cmd_display).await;
                flush_log_tail(&job.cmd_display, &mut stdout_log_buf);
                return finish(&job, status, result);
            }
            n = stdout.read(&mut read_buf), if !stdout_done => {
                match n {
                    Ok(0) => {
                        flush_log_tail(&job.cmd_display, &mut stdout_log_buf);
                        stdout_done = true;
                    }
                    Ok(n) => {
                        log_stdout_chunk(&job.cmd_display, &mut stdout_log_buf, &read_buf[..n]);
                        push_bytes(&mut result, &read_buf[..n]);
                    }
                    Err(e) => { warn!("error reading stdout of '{}': {}", job.cmd_display, e); stdout_done = true; }
                }
            }
            line = async {
                match stderr_lines.as_mut() {
                    Some(lines) => lines.next_line().await,
                    None => std::future::pending().await,
                }
            }, if !stderr_done => {
                match line {
                    Ok(Some(l)) => debug!("'{}'(err) '{}'", job.cmd_display, l),
                    Ok(None) => stderr_done = true,
                    Err(e) => { warn!("error reading stderr of '{}': {}", job.cmd_display, e); stderr_done = true; }
                }
            }
            _ = warn_sleep => {
                warned = true;
                warn!("spawned process '{}' is taking longer than expected to complete", job.cmd_display);
            }
            _ = kill_sleep => {
                error!("spawned process '{}' timed out, killing", job.cmd_display);
                send_kill(&child);
                let _ = child.wait().await;
                return Err(anyhow!("'{}' timed out after {}us and was killed", job.cmd_display, timeout_usec));
            }
        }
    }
}

async fn drain_remaining(
    stdout: &mut tokio::process::ChildStdout,
    result: &mut String,
    log_buf: &mut String,
    cmd_display: &str,
) {
    let mut buf = [0u8; 4096];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                log_stdout_chunk(cmd_display, log_buf, &buf[..n]);
                push_bytes(result, &buf[..n]);
            }
        }
    }
}

/// Appends raw bytes split by newline into per-line debug log entries,
/// buffering any trailing partial line in `log_buf` until the next chunk
/// or stream end completes it.
fn log_stdout_chunk(cmd_display: &str, log_buf: &mut String, chunk: &[u8]) {
    log_buf.push_str(&String::from_utf8_lossy(chunk));
    while let Some(pos) = log_buf.find('\n') {
        let line: String = log_buf.drain(..=pos).collect();
        debug!("'{}'(out) '{}'", cmd_display, line.trim_end_matches(['\n', '\r']));
    }
}

/// Logs whatever partial line is left in `log_buf` once the stream ends,
/// since it will never see a trailing newline to trigger `log_stdout_chunk`.
fn flush_log_tail(cmd_display: &str, log_buf: &mut String) {
    if !log_buf.is_empty() {
        debug!("'{}'(out) '{}'", cmd_display, std::mem::take(log_buf));
    }
}

/// Appends raw bytes into the bounded result buffer, keeping at most
/// `RESULT_CAPACITY - 1` bytes (the final slot is reserved for the NUL
/// terminator upstream's fixed buffer always carries). Byte-exact: unlike
/// line-based capture, trailing newlines and `\r` are preserved.
fn push_bytes(result: &mut String, chunk: &[u8]) {
    let usable = RESULT_CAPACITY - 1;
    let room = usable.saturating_sub(result.len());
    if room == 0 {
        return;
    }
    let take = chunk.len().min(room);
    result.push_str(&String::from_utf8_lossy(&chunk[..take]));
}

/// Continue (in case stopped) and kill the child's process group, matching
/// the kill-timer's `SIGCONT` then `SIGKILL` sequence upstream.
fn send_kill(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        let pgid = -(pid as i32);
        unsafe {
            libc::kill(pgid, libc::SIGCONT);
            libc::kill(pgid, libc::SIGKILL);
        }
    }
}

/// Maps the child's exit status to the spawner's result per distilled §7:
/// a clean exit (or a nonzero exit with `accept_failure`) succeeds at this
/// level; a nonzero exit without `accept_failure`, or termination by
/// signal, is returned as an error to the caller.
fn finish(job: &SpawnJob, status: std::process::ExitStatus, result: String) -> Result<String> {
    match status.code() {
        Some(0) => {
            debug!("process '{}' succeeded", job.cmd_display);
            Ok(result)
        }
        Some(code) => {
            if job.accept_failure {
                debug!("process '{}' failed with exit code {}", job.cmd_display, code);
                Ok(result)
            } else {
                warn!("process '{}' failed with exit code {}", job.cmd_display, code);
                Err(anyhow!("'{}' failed with exit code {}", job.cmd_display, code))
            }
        }
        None => {
            use std::os::unix::process::ExitStatusExt;
            let sig = status.signal().unwrap_or(0);
            warn!("process '{}' terminated by signal {}", job.cmd_display, sig);
            Err(anyhow!("'{}' terminated by signal {}", job.cmd_display, sig))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_handles_quotes_and_unterminated_quote() {
        assert_eq!(tokenize("a b c"), vec!["a", "b", "c"]);
        assert_eq!(tokenize("a 'b c' d"), vec!["a", "b c", "d"]);
        assert_eq!(tokenize(r#"echo "hello world""#), vec!["echo", "hello world"]);
        // Unterminated quote takes the remainder of the line as one token.
        assert_eq!(tokenize("a 'b c"), vec!["a", "b c"]);
    }

    #[test]
    fn tokenize_backslash_escapes_next_byte() {
        assert_eq!(tokenize(r"foo\ bar"), vec!["foo bar"]);
        assert_eq!(tokenize(r#"a\"b c"#), vec!["a\"b", "c"]);
        assert_eq!(tokenize(r"a\\b"), vec![r"a\b"]);
    }

    #[test]
    fn non_absolute_argv0_resolves_against_libexec() {
        let dev = Device::bare("sda", crate::device::Action::Add);
        let job = SpawnJob::from_command_line("mkswap $env{DEVNAME}", &dev, 0).unwrap();
        assert_eq!(job.argv[0], format!("{}/mkswap", LIBEXEC_DIR));
    }

    #[test]
    fn absolute_argv0_is_untouched() {
        let dev = Device::bare("sda", crate::device::Action::Add);
        let job = SpawnJob::from_command_line("/bin/true", &dev, 0).unwrap();
        assert_eq!(job.argv[0], "/bin/true");
    }

    #[test]
    fn result_capacity_truncates_without_error() {
        let mut result = String::new();
        push_bytes(&mut result, "x".repeat(RESULT_CAPACITY + 10).as_bytes());
        assert_eq!(result.len(), RESULT_CAPACITY - 1);
    }

    #[test]
    fn result_bytes_preserve_trailing_newline() {
        let mut result = String::new();
        push_bytes(&mut result, b"hello\n");
        assert_eq!(result, "hello\n");
        assert_eq!(result.len(), 6);
    }
}
