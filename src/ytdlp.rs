#![forbid(unsafe_code)]

//! Thin wrapper around the `yt-dlp` executable.
//!
//! yt-dlp is treated as a black box: metadata mode prints one JSON document
//! on stdout, download mode prints raw media bytes. stderr only ever carries
//! diagnostics and is never forwarded to clients.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::{GatewayError, Result};
use crate::formats::{VideoSummary, summarize_json};

/// Handle on the configured yt-dlp binary. Cheap to clone, one per server.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Name used in log lines and error messages (`yt-dlp`, not the full
    /// path to the binary).
    pub fn label(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }

    /// Runs yt-dlp in metadata mode and returns its raw stdout.
    ///
    /// The child is killed if the returned future is dropped, which is what
    /// happens when the HTTP client disconnects mid-request.
    pub async fn fetch_metadata(&self, url: &str) -> Result<Vec<u8>> {
        let output = self
            .command(metadata_args(url))
            .output()
            .await
            .map_err(|source| self.start_error(source))?;

        if !output.status.success() || output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let err = GatewayError::Execution {
                program: self.label(),
                code: output
                    .status
                    .code()
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "null".to_string()),
                stderr: if stderr.is_empty() {
                    "No output".to_string()
                } else {
                    stderr
                },
            };
            tracing::error!(url, "{err}");
            return Err(err);
        }

        Ok(output.stdout)
    }

    /// Fetches metadata and normalizes it into the client-facing summary.
    pub async fn video_info(&self, url: &str) -> Result<VideoSummary> {
        let raw = self.fetch_metadata(url).await?;
        summarize_json(&raw).inspect_err(|err| {
            tracing::error!(url, error = %err, "yt-dlp returned malformed metadata");
        })
    }

    /// Starts yt-dlp in download mode with both output streams piped.
    pub fn spawn_download(&self, url: &str, itag: &str) -> Result<Child> {
        self.command(download_args(url, itag))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| self.start_error(source))
    }

    fn command(&self, args: Vec<String>) -> Command {
        let mut command = Command::new(&self.program);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    fn start_error(&self, source: std::io::Error) -> GatewayError {
        GatewayError::ProcessStart {
            program: self.program.clone(),
            source,
        }
    }
}

/// `-J` dumps a single JSON document. The `--` keeps a URL starting with a
/// dash from being read as an option.
pub fn metadata_args(url: &str) -> Vec<String> {
    vec![
        "-J".to_string(),
        "--no-warnings".to_string(),
        "--no-check-certificate".to_string(),
        "--".to_string(),
        url.to_string(),
    ]
}

/// Selects exactly one format and writes it to stdout (`-o -`).
pub fn download_args(url: &str, itag: &str) -> Vec<String> {
    vec![
        "-f".to_string(),
        itag.to_string(),
        "-o".to_string(),
        "-".to_string(),
        "--no-warnings".to_string(),
        "--no-progress".to_string(),
        "--".to_string(),
        url.to_string(),
    ]
}


#[cfg(test)]
mod tests {
    use super::test_support::install_stub;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn metadata_args_keep_url_last() {
        let args = metadata_args("https://youtu.be/dQw4w9WgXcQ");
        assert_eq!(
            args,
            [
                "-J",
                "--no-warnings",
                "--no-check-certificate",
                "--",
                "https://youtu.be/dQw4w9WgXcQ"
            ]
        );
    }

    #[test]
    fn download_args_select_format_and_stdout() {
        let args = download_args("https://youtu.be/x", "22");
        assert_eq!(&args[..4], ["-f", "22", "-o", "-"]);
        assert_eq!(args.last().unwrap(), "https://youtu.be/x");
    }

    #[test]
    fn label_uses_file_name() {
        assert_eq!(YtDlp::new("/usr/local/bin/yt-dlp").label(), "yt-dlp");
        assert_eq!(YtDlp::new("yt-dlp").label(), "yt-dlp");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn video_info_parses_stub_output() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            r#"cat <<'JSON'
{"title":"Stub","duration_string":"1:00","formats":[
 {"format_id":"137","ext":"mp4","width":1920,"height":1080,"filesize":10485760},
 {"format_id":"138","ext":"mp4","width":1920,"height":1080,"filesize":20971520}
]}
JSON"#,
        );
        let summary = YtDlp::new(stub)
            .video_info("https://youtu.be/x")
            .await
            .unwrap();
        assert_eq!(summary.title, "Stub");
        assert_eq!(summary.formats.len(), 1);
        assert_eq!(summary.formats[0].itag, "137");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stub_receives_metadata_flags() {
        let dir = tempdir().unwrap();
        let args_file = dir.path().join("args.txt");
        let stub = install_stub(
            dir.path(),
            &format!(
                "printf '%s\\n' \"$@\" > '{}'\necho '{{}}'",
                args_file.display()
            ),
        );
        YtDlp::new(stub).fetch_metadata("https://youtu.be/x").await.unwrap();
        let recorded = std::fs::read_to_string(&args_file).unwrap();
        let recorded: Vec<&str> = recorded.lines().collect();
        assert_eq!(recorded, metadata_args("https://youtu.be/x"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "echo 'ERROR: Unsupported URL' >&2\nexit 1");
        let err = YtDlp::new(stub)
            .fetch_metadata("https://example.com")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "execution");
        assert_eq!(
            err.to_string(),
            "yt-dlp failed with code 1: ERROR: Unsupported URL"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn empty_output_without_stderr_says_so() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "exit 0");
        let err = YtDlp::new(stub)
            .fetch_metadata("https://example.com")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "yt-dlp failed with code 0: No output");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn garbage_output_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "echo 'definitely not json'");
        let err = YtDlp::new(stub)
            .video_info("https://example.com")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "parse");
    }

    #[tokio::test]
    async fn missing_binary_is_a_start_error() {
        let dir = tempdir().unwrap();
        let ytdlp = YtDlp::new(dir.path().join("does-not-exist"));
        let err = ytdlp.fetch_metadata("https://example.com").await.unwrap_err();
        assert_eq!(err.kind(), "process_start");
        let err = ytdlp.spawn_download("https://example.com", "22").unwrap_err();
        assert_eq!(err.kind(), "process_start");
    }
}
