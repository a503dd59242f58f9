//! Audio Fetch Service: contract plus the yt-dlp implementation.
//!
//! The fetcher writes `<target_dir>/<filename_stem>.<format>` and reports
//! typed failures. The raw provider text is preserved in the error so the
//! worker can classify bot detection itself.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::backoff::is_bot_block;
use crate::error::FetchError;

/// Hard limit for one fetch subprocess.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(300);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Failure phrases that will not go away on retry (lowercase).
pub const PERMANENT_SIGNATURES: &[&str] = &[
    "video unavailable",
    "private video",
    "this video is private",
    "has been removed",
    "downloaded file is empty",
    "drm protected",
];

pub fn is_permanent_failure(failure_text: &str) -> bool {
    let lower = failure_text.to_lowercase();
    PERMANENT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

pub fn video_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

/// One fetch request.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub video_id: &'a str,
    pub target_dir: &'a Path,
    pub filename_stem: &'a str,
    pub format: &'a str,
}

impl FetchRequest<'_> {
    /// Where the fetched audio is expected to land.
    pub fn expected_path(&self) -> PathBuf {
        self.target_dir
            .join(format!("{}.{}", self.filename_stem, self.format))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAudio {
    pub path: PathBuf,
}

/// External audio acquisition collaborator.
pub trait AudioFetcher: Send + Sync {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchedAudio, FetchError>;
}

/// Map a failed fetch's stderr to the retry-worthy or the permanent family.
/// Bot detection wins when both kinds of phrase appear.
pub fn classify_failure(stderr: &str) -> FetchError {
    let message = stderr.trim().to_string();
    if !is_bot_block(&message) && is_permanent_failure(&message) {
        FetchError::Unavailable { message }
    } else {
        FetchError::Failed { message }
    }
}

// ============================================================================
// Subprocess Runner
// ============================================================================

pub(crate) struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Read a pipe to the end. Invalid UTF-8 is replaced, never dropped, so the
/// rest of the text can still be classified.
fn drain<R: Read + Send + 'static>(reader: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut r) = reader {
            let _ = r.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Run a command, killing it once `timeout` elapses. `Ok(None)` means it was killed.
pub(crate) fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
) -> std::io::Result<Option<ProcessOutput>> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let start = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(Some(ProcessOutput {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    }))
}

// ============================================================================
// yt-dlp
// ============================================================================

/// yt-dlp backed fetcher (also used for search, see `fallback`).
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn download_command(&self, request: &FetchRequest<'_>) -> Command {
        // yt-dlp treats '%' in the output template as a field reference.
        let template = request.target_dir.join(format!(
            "{}.%(ext)s",
            request.filename_stem.replace('%', "%%")
        ));
        let mut cmd = Command::new(&self.program);
        cmd.arg("-x")
            .args(["--audio-format", request.format])
            .args(["--audio-quality", "0"])
            .arg("--no-playlist")
            .arg("--force-overwrites")
            .arg("-o")
            .arg(template)
            .arg(video_url(request.video_id));
        cmd
    }
}

impl AudioFetcher for YtDlp {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchedAudio, FetchError> {
        std::fs::create_dir_all(request.target_dir)?;
        debug!(
            "yt-dlp fetch {} -> {}",
            request.video_id,
            request.expected_path().display()
        );

        let output = run_with_timeout(self.download_command(request), self.timeout)?.ok_or(
            FetchError::Timeout {
                secs: self.timeout.as_secs(),
            },
        )?;

        if output.status.success() {
            Ok(FetchedAudio {
                path: request.expected_path(),
            })
        } else if output.stderr.trim().is_empty() {
            Err(FetchError::Failed {
                message: format!("yt-dlp exited with {}: {}", output.status, output.stdout.trim()),
            })
        } else {
            Err(classify_failure(&output.stderr))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_failure_permanent() {
        let err = classify_failure("ERROR: [youtube] x: Video unavailable. This video is private.");
        assert!(matches!(err, FetchError::Unavailable { .. }));
        let err = classify_failure("ERROR: The downloaded file is empty");
        assert!(matches!(err, FetchError::Unavailable { .. }));
    }

    #[test]
    fn test_classify_failure_bot_wins() {
        let err = classify_failure(
            "ERROR: Sign in to confirm you're not a bot. Video unavailable",
        );
        match err {
            FetchError::Failed { message } => assert!(is_bot_block(&message)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_failure_other() {
        let err = classify_failure("ERROR: unable to extract player response");
        assert!(matches!(err, FetchError::Failed { .. }));
    }

    #[test]
    fn test_expected_path() {
        let dir = PathBuf::from("/music");
        let request = FetchRequest {
            video_id: "abc",
            target_dir: &dir,
            filename_stem: "My Song",
            format: "mp3",
        };
        assert_eq!(request.expected_path(), PathBuf::from("/music/My Song.mp3"));
    }

    #[test]
    fn test_download_command_escapes_percent() {
        let dir = PathBuf::from("/music");
        let request = FetchRequest {
            video_id: "abc",
            target_dir: &dir,
            filename_stem: "100% Pure",
            format: "mp3",
        };
        let cmd = YtDlp::new("yt-dlp").download_command(&request);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"/music/100%% Pure.%(ext)s".to_string()));
        assert_eq!(args.last().unwrap(), "https://www.youtube.com/watch?v=abc");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_timeout_captures_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err 1>&2"]);
        let output = run_with_timeout(cmd, Duration::from_secs(10))
            .unwrap()
            .unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[test]
    fn test_invalid_utf8_stderr_is_still_classified() {
        let mut cmd = Command::new("sh");
        cmd.args([
            "-c",
            "printf '\\377 ERROR: Sign in to confirm you'\\''re not a bot' 1>&2; exit 1",
        ]);
        let output = run_with_timeout(cmd, Duration::from_secs(10))
            .unwrap()
            .unwrap();
        assert!(!output.status.success());
        assert!(output.stderr.starts_with('\u{FFFD}'));
        assert!(is_bot_block(&output.stderr));
        assert!(matches!(
            classify_failure(&output.stderr),
            FetchError::Failed { .. }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_timeout_kills_slow_process() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5"]);
        let output = run_with_timeout(cmd, Duration::from_millis(200)).unwrap();
        assert!(output.is_none());
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = YtDlp::new("/nonexistent/yt-dlp-binary");
        let request = FetchRequest {
            video_id: "abc",
            target_dir: dir.path(),
            filename_stem: "x",
            format: "mp3",
        };
        assert!(matches!(
            fetcher.fetch(&request),
            Err(FetchError::Spawn(_))
        ));
    }
}
