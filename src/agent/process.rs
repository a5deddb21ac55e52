//! Subprocess plumbing shared by the adapters.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EventSink, RunOpts, StreamEvent, StreamKind};
use crate::error::{BatonError, Result};

/// Prompts larger than this are handed to the agent through a file.
pub const LARGE_PROMPT_BYTES: usize = 100 * 1024;

/// Prompt argument ready to pass on the command line. Holds the temporary
/// file, if any, which is deleted when this is dropped.
pub(crate) struct PreparedPrompt {
    pub arg: String,
    _file: Option<NamedTempFile>,
}

pub(crate) fn prepare_prompt(prompt: &str) -> Result<PreparedPrompt> {
    if prompt.len() <= LARGE_PROMPT_BYTES {
        return Ok(PreparedPrompt {
            arg: prompt.to_string(),
            _file: None,
        });
    }

    let mut file = tempfile::Builder::new()
        .prefix("baton-prompt-")
        .suffix(".md")
        .tempfile()?;
    std::io::Write::write_all(&mut file, prompt.as_bytes())?;
    let arg = file_prompt(&file.path().display().to_string());
    debug!(bytes = prompt.len(), path = %file.path().display(), "prompt written to file");
    Ok(PreparedPrompt {
        arg,
        _file: Some(file),
    })
}

fn file_prompt(path: &str) -> String {
    format!("Your full instructions are in the file {path}. Read that file and follow it exactly.")
}

/// What `prepare_prompt` would pass, without touching the filesystem.
pub(crate) fn display_prompt(prompt: &str) -> String {
    if prompt.len() <= LARGE_PROMPT_BYTES {
        prompt.to_string()
    } else {
        file_prompt(&format!("<temp file, {} bytes>", prompt.len()))
    }
}

pub(crate) fn resolve_executable(agent: &str, program: &str) -> Result<PathBuf> {
    which::which(program).map_err(|e| BatonError::Prerequisite {
        agent: agent.to_string(),
        reason: format!("`{program}` not found: {e}"),
    })
}

/// Quote an argument for display in a POSIX shell.
pub(crate) fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

pub(crate) fn render_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Captured result of a finished subprocess.
pub(crate) struct RawOutput {
    pub exit_code: i32,
    pub duration: Duration,
    pub stdout: String,
    pub stderr: String,
}

/// Spawn `program` with `args` (no shell), capture both streams, forward
/// lines to the event sink, and kill the child on cancellation or deadline.
pub(crate) async fn execute(
    agent: &str,
    program: &str,
    args: &[String],
    opts: &RunOpts,
    cancel: &CancellationToken,
) -> Result<RawOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &opts.workdir {
        cmd.current_dir(dir);
    }
    cmd.envs(opts.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|source| BatonError::Spawn {
        agent: agent.to_string(),
        source,
    })?;
    debug!(agent, pid = child.id(), "agent process started");

    let stdout_task = tokio::spawn(collect_lines(
        child.stdout.take(),
        agent.to_string(),
        StreamKind::Stdout,
        opts.events.clone(),
    ));
    let stderr_task = tokio::spawn(collect_lines(
        child.stderr.take(),
        agent.to_string(),
        StreamKind::Stderr,
        opts.events.clone(),
    ));

    let deadline = async {
        match opts.timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            terminate(agent, &mut child).await;
            return Err(BatonError::Cancelled);
        }
        _ = deadline => {
            terminate(agent, &mut child).await;
            return Err(BatonError::DeadlineExceeded(opts.timeout.unwrap_or_default()));
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let exit_code = status.code().unwrap_or(-1);
    let duration = started.elapsed();
    debug!(agent, exit_code, elapsed_ms = duration.as_millis() as u64, "agent process exited");

    Ok(RawOutput {
        exit_code,
        duration,
        stdout,
        stderr,
    })
}

async fn terminate(agent: &str, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(agent, error = %e, "failed to kill agent process");
        return;
    }
    match child.wait().await {
        Ok(status) => debug!(agent, %status, "agent process killed"),
        Err(e) => warn!(agent, error = %e, "failed to reap killed agent process"),
    }
}

/// Drain `reader` to EOF. Invalid UTF-8 is replaced rather than ending the
/// read, so the child never sees a closed pipe while it is still writing.
async fn collect_lines<R>(
    reader: Option<R>,
    agent: String,
    kind: StreamKind,
    sink: Option<EventSink>,
) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut captured = String::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(agent = %agent, stream = ?kind, error = %e, "failed reading agent output");
                break;
            }
        }
        let raw = buf.strip_suffix(b"\n").unwrap_or(&buf);
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw).into_owned();
        if let Some(sink) = &sink {
            let json = line
                .trim_start()
                .starts_with('{')
                .then(|| serde_json::from_str(&line).ok())
                .flatten();
            let _ = sink.send(StreamEvent {
                agent: agent.clone(),
                kind,
                line: line.clone(),
                json,
            });
        }
        captured.push_str(&line);
        captured.push('\n');
    }
    captured
}
