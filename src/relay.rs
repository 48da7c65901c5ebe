#![forbid(unsafe_code)]

//! Pipes yt-dlp's stdout straight into an HTTP response body.
//!
//! Each download gets one child process and two helper tasks: one drains
//! stderr into the log, the other waits for the process to exit. The body
//! stream holds a cancellation guard; if the body is dropped before stdout
//! hits EOF (client disconnected), the guard fires and the supervisor kills
//! the process instead of leaving it writing into a closed pipe.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::ExitStatus;
use std::task::{Context, Poll};

use axum::body::Bytes;
use futures_core::Stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::Result;
use crate::ytdlp::YtDlp;

/// How a relayed download ended from the process' point of view.
#[derive(Debug)]
pub enum RelayOutcome {
    /// yt-dlp exited on its own. A failure status is only logged because
    /// the response has usually started by then.
    Exited(ExitStatus),
    /// The response body went away first and the process was killed.
    Cancelled,
}

/// A running download: the body to hand to axum plus the supervisor task.
pub struct Relay {
    pub body: RelayBody,
    pub supervisor: JoinHandle<io::Result<RelayOutcome>>,
}

/// Streams stdout chunks as they arrive. Reads only happen when the body is
/// polled, so a slow client throttles yt-dlp through the pipe.
pub struct RelayBody {
    stream: ReaderStream<ChildStdout>,
    guard: Option<DropGuard>,
}

impl Stream for RelayBody {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let next = Pin::new(&mut this.stream).poll_next(cx);
        if let Poll::Ready(None) = next
            && let Some(guard) = this.guard.take()
        {
            // EOF: let the supervisor collect the real exit status.
            guard.disarm();
        }
        next
    }
}

/// Spawns yt-dlp for `itag` and wires up the relay.
///
/// Fails only when the process cannot be started; everything after that is
/// reported through logs and the supervisor's [`RelayOutcome`].
pub fn start(ytdlp: &YtDlp, url: &str, itag: &str) -> Result<Relay> {
    let mut child = ytdlp.spawn_download(url, itag)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("yt-dlp stdout was not captured"))?;

    if let Some(stderr) = child.stderr.take() {
        spawn_logged("stderr", log_stderr(stderr, itag.to_string()));
    }

    let cancel = CancellationToken::new();
    let supervisor = tokio::spawn(supervise(child, cancel.clone(), itag.to_string()));

    Ok(Relay {
        body: RelayBody {
            stream: ReaderStream::new(stdout),
            guard: Some(cancel.drop_guard()),
        },
        supervisor,
    })
}

async fn supervise(
    mut child: Child,
    cancel: CancellationToken,
    itag: String,
) -> io::Result<RelayOutcome> {
    let exited = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        status = child.wait() => Some(status),
    };

    let outcome = match exited {
        Some(status) => {
            let status = status.inspect_err(|err| {
                tracing::warn!(itag, error = %err, "waiting on yt-dlp failed");
            })?;
            if status.success() {
                tracing::info!(itag, "download finished");
            } else {
                tracing::error!(itag, %status, "Download failed with code {:?}", status.code());
            }
            RelayOutcome::Exited(status)
        }
        None => {
            tracing::warn!(itag, "client disconnected, stopping yt-dlp");
            child.kill().await.inspect_err(|err| {
                tracing::warn!(itag, error = %err, "failed to kill yt-dlp");
            })?;
            RelayOutcome::Cancelled
        }
    };
    Ok(outcome)
}

async fn log_stderr(stderr: ChildStderr, itag: String) -> io::Result<()> {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end();
        if !text.is_empty() {
            tracing::warn!(itag, "yt-dlp: {text}");
        }
    }
}

/// Runs a fire-and-forget task whose failure is logged but never escalated.
fn spawn_logged<F>(task: &'static str, future: F)
where
    F: Future<Output = io::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = future.await {
            tracing::warn!(task, error = %err, "background task failed");
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ytdlp::test_support::install_stub;
    use axum::body::{Body, to_bytes};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn process_alive(pid: &str) -> bool {
        std::process::Command::new("kill")
            .args(["-0", pid])
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn write_payload(dir: &Path) -> (Vec<u8>, std::path::PathBuf) {
        // Large enough to span many pipe reads, and not chunk aligned.
        let payload: Vec<u8> = (0..300_001u32).map(|i| (i * 31 % 251) as u8).collect();
        let path = dir.join("payload.bin");
        std::fs::write(&path, &payload).unwrap();
        (payload, path)
    }

    #[tokio::test]
    async fn body_matches_stdout_byte_for_byte() {
        let dir = tempdir().unwrap();
        let (payload, path) = write_payload(dir.path());
        let stub = install_stub(
            dir.path(),
            &format!("echo 'noise on stderr' >&2\ncat '{}'", path.display()),
        );

        let relay = start(&YtDlp::new(stub), "https://youtu.be/x", "137").unwrap();
        let bytes = to_bytes(Body::from_stream(relay.body), usize::MAX)
            .await
            .unwrap();
        assert_eq!(bytes.len(), payload.len());
        assert!(bytes[..] == payload[..]);

        match relay.supervisor.await.unwrap().unwrap() {
            RelayOutcome::Exited(status) => assert!(status.success()),
            RelayOutcome::Cancelled => panic!("completed download reported as cancelled"),
        }
    }

    #[tokio::test]
    async fn failure_after_partial_output_keeps_sent_bytes() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "printf 'partial'\necho 'boom' >&2\nexit 3");

        let relay = start(&YtDlp::new(stub), "https://youtu.be/x", "22").unwrap();
        let bytes = to_bytes(Body::from_stream(relay.body), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"partial");

        match relay.supervisor.await.unwrap().unwrap() {
            RelayOutcome::Exited(status) => assert_eq!(status.code(), Some(3)),
            RelayOutcome::Cancelled => panic!("expected a natural exit"),
        }
    }

    #[tokio::test]
    async fn dropping_the_body_kills_the_process() {
        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let stub = install_stub(
            dir.path(),
            &format!("echo $$ > '{}'\nexec yes", pid_file.display()),
        );

        let Relay {
            mut body,
            supervisor,
        } = start(&YtDlp::new(stub), "https://youtu.be/x", "18").unwrap();

        let first = std::future::poll_fn(|cx| Pin::new(&mut body).poll_next(cx))
            .await
            .unwrap()
            .unwrap();
        assert!(!first.is_empty());
        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        assert!(process_alive(&pid));

        drop(body);
        let outcome = tokio::time::timeout(Duration::from_secs(5), supervisor)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, RelayOutcome::Cancelled));
        assert!(!process_alive(&pid));
    }

    #[tokio::test]
    async fn missing_binary_fails_before_streaming() {
        let dir = tempdir().unwrap();
        let err = start(&YtDlp::new(dir.path().join("nope")), "https://youtu.be/x", "22")
            .err()
            .unwrap();
        assert_eq!(err.kind(), "process_start");
    }
}
