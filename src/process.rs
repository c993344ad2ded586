//! Runs the external `yt-dlp` binary.
//!
//! Every invocation goes through [`ProcessRunner`], which caps how many
//! children run at once and kills any child that outlives its deadline.

use std::{
    collections::VecDeque,
    io,
    path::PathBuf,
    pin::Pin,
    process::{ExitStatus, Stdio},
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader, ReadBuf},
    process::{Child, ChildStdout, Command},
    sync::{OwnedSemaphorePermit, Semaphore},
};
use tracing::{debug, error, info};

use crate::error::DownloadError;

pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_TAIL_LINES: usize = 200;

#[derive(Clone, Debug)]
pub struct ProcessRunner {
    binary: PathBuf,
    permits: Arc<Semaphore>,
    job_timeout: Duration,
    capture_timeout: Duration,
}

impl ProcessRunner {
    pub fn new(binary: impl Into<PathBuf>, max_concurrent: usize, job_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            job_timeout,
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
        }
    }

    /// Runs a download to completion, handing every stdout/stderr line to
    /// `on_line` as soon as it is read.
    pub async fn run_download<F>(
        &self,
        label: &str,
        url: &str,
        args: &[String],
        mut on_line: F,
    ) -> Result<(), DownloadError>
    where
        F: FnMut(&str) + Send,
    {
        let _permit = self.acquire().await?;
        info!(job = label, binary = %self.binary.display(), ?args, "starting yt-dlp");

        let mut child = self.spawn(url, args, Stdio::piped())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("failed to capture yt-dlp stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("failed to capture yt-dlp stderr"))?;

        // yt-dlp echoes file names verbatim, which are not always UTF-8.
        let mut stdout_lines = BufReader::new(stdout).split(b'\n');
        let mut stderr_lines = BufReader::new(stderr).split(b'\n');
        let mut tail = OutputTail::default();

        let read = async {
            let mut stdout_open = true;
            let mut stderr_open = true;
            while stdout_open || stderr_open {
                tokio::select! {
                    line = stdout_lines.next_segment(), if stdout_open => match line? {
                        Some(raw) => {
                            let line = decode_line(&raw);
                            on_line(&line);
                            tail.push_stdout(line);
                        }
                        None => stdout_open = false,
                    },
                    line = stderr_lines.next_segment(), if stderr_open => match line? {
                        Some(raw) => {
                            let line = decode_line(&raw);
                            on_line(&line);
                            tail.push_stderr(line);
                        }
                        None => stderr_open = false,
                    },
                }
            }
            child.wait().await
        };

        let status = match tokio::time::timeout(self.job_timeout, read).await {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.kill().await;
                error!(job = label, ?args, timeout = ?self.job_timeout, "yt-dlp timed out, killed");
                return Err(DownloadError::Timeout(self.job_timeout));
            }
        };

        check_status(label, args, status, tail.into_diagnostic())
    }

    /// Runs a metadata-style command and returns its stdout.
    pub async fn capture(&self, url: &str, args: &[String]) -> Result<String, DownloadError> {
        let _permit = self.acquire().await?;
        debug!(binary = %self.binary.display(), ?args, url, "capturing yt-dlp output");

        let child = self.spawn(url, args, Stdio::piped())?;
        let output = match tokio::time::timeout(self.capture_timeout, child.wait_with_output()).await
        {
            Ok(output) => output?,
            Err(_) => return Err(DownloadError::Timeout(self.capture_timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let diagnostic = if stderr.trim().is_empty() {
            stdout.clone()
        } else {
            stderr
        };
        check_status(url, args, output.status, diagnostic)?;
        Ok(stdout)
    }

    /// Spawns the tool writing media to stdout and returns a reader over it.
    /// The child is killed when the reader is dropped.
    pub async fn stream(&self, url: &str, args: &[String]) -> Result<MediaStream, DownloadError> {
        let permit = self.acquire().await?;
        info!(url, ?args, "streaming through yt-dlp");
        let mut child = self.spawn(url, args, Stdio::null())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("failed to capture yt-dlp stdout"))?;
        Ok(MediaStream {
            _child: child,
            _permit: permit,
            stdout,
        })
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, DownloadError> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DownloadError::Io(io::Error::other("process pool closed")))
    }

    fn spawn(&self, url: &str, args: &[String], stderr: Stdio) -> Result<Child, DownloadError> {
        let mut command = Command::new(&self.binary);
        command
            .arg(url)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .kill_on_drop(true);

        command.spawn().map_err(|err| match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                error!(binary = %self.binary.display(), %err, "cannot launch yt-dlp");
                DownloadError::ToolNotFound(self.binary.display().to_string())
            }
            _ => DownloadError::Io(err),
        })
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn check_status(
    label: &str,
    args: &[String],
    status: ExitStatus,
    diagnostic: String,
) -> Result<(), DownloadError> {
    if status.success() {
        debug!(job = label, "yt-dlp completed successfully");
        return Ok(());
    }
    let code = status.code();
    error!(job = label, ?args, ?code, stderr = %diagnostic, "yt-dlp exited with failure");
    Err(DownloadError::ProcessFailed {
        code,
        stderr: diagnostic.trim().to_string(),
    })
}

/// Last lines of each stream, kept for the failure message.
#[derive(Default)]
struct OutputTail {
    stdout: VecDeque<String>,
    stderr: VecDeque<String>,
}

impl OutputTail {
    fn push_stdout(&mut self, line: String) {
        push_bounded(&mut self.stdout, line);
    }

    fn push_stderr(&mut self, line: String) {
        push_bounded(&mut self.stderr, line);
    }

    fn into_diagnostic(self) -> String {
        let lines = if self.stderr.is_empty() {
            self.stdout
        } else {
            self.stderr
        };
        Vec::from(lines).join("\n")
    }
}

fn push_bounded(lines: &mut VecDeque<String>, line: String) {
    if lines.len() == MAX_TAIL_LINES {
        lines.pop_front();
    }
    lines.push_back(line);
}

/// Media bytes coming out of a running child. Holds the child and its
/// concurrency permit for as long as the body is being read.
pub struct MediaStream {
    _child: Child,
    _permit: OwnedSemaphorePermit,
    stdout: ChildStdout,
}

impl AsyncRead for MediaStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    /// Writes an executable bash script standing in for yt-dlp.
    pub(crate) fn install_stub(dir: &Path, body: &str) -> PathBuf {
        let script_path = dir.join("yt-dlp");
        let script = format!("#!/usr/bin/env bash\nset -u\n{body}\n");
        fs::write(&script_path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms).unwrap();
        }
        script_path
    }
}
