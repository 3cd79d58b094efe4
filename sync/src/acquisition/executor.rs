//! External downloader process

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use media_sync_core::MediaMetadata;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use super::thumbnail::video_id;
use super::transcript::{DownloadUpdate, TranscriptParser};
use crate::error::{Result, SyncError};

/// Runs one download+transcode and reports progress while it runs
#[async_trait]
pub trait DownloadExecutor: Send + Sync {
    /// Fetch `url` as audio for job `job_id`, sending parsed progress on
    /// `updates`. Returns the produced file on success.
    async fn run(&self, job_id: i64, url: &str, updates: mpsc::Sender<DownloadUpdate>) -> Result<PathBuf>;

    /// Look up title, uploader, duration and thumbnail without downloading
    async fn probe_metadata(&self, url: &str) -> Result<MediaMetadata>;
}

/// How to invoke the downloader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloaderOptions {
    pub program: String,
    /// Arguments placed before everything else, e.g. `["-m", "yt_dlp"]`
    pub program_args: Vec<String>,
    /// Arguments placed just before the URL
    pub extra_args: Vec<String>,
    pub temp_dir: PathBuf,
    pub audio_format: String,
    pub audio_quality: String,
}

impl Default for DownloaderOptions {
    fn default() -> Self {
        Self {
            program: "yt-dlp".to_string(),
            program_args: Vec::new(),
            extra_args: Vec::new(),
            temp_dir: std::env::temp_dir(),
            audio_format: "mp3".to_string(),
            audio_quality: "128K".to_string(),
        }
    }
}

impl DownloaderOptions {
    /// Where the downloader writes the audio for `job_id`
    pub fn output_path(&self, job_id: i64) -> PathBuf {
        self.temp_dir
            .join(format!("media-sync-{}.{}", job_id, self.audio_format))
    }

    /// Full argument list for a download
    pub fn download_args(&self, job_id: i64, url: &str) -> Vec<String> {
        let template = self.temp_dir.join(format!("media-sync-{}.%(ext)s", job_id));

        let mut args = self.program_args.clone();
        args.extend(
            [
                "-x",
                "--audio-format",
                self.audio_format.as_str(),
                "--audio-quality",
                self.audio_quality.as_str(),
                "--add-metadata",
                "--no-playlist",
                "--progress",
                "--newline",
                "-o",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(template.to_string_lossy().into_owned());
        args.extend(self.extra_args.iter().cloned());
        args.push(url.to_string());
        args
    }

    /// Argument list for a metadata lookup
    pub fn metadata_args(&self, url: &str) -> Vec<String> {
        let mut args = self.program_args.clone();
        args.push("--dump-json".to_string());
        args.push("--no-playlist".to_string());
        args.extend(self.extra_args.iter().cloned());
        args.push(url.to_string());
        args
    }
}

/// Subset of the downloader's `--dump-json` document
#[derive(Debug, Deserialize)]
struct InfoJson {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    thumbnail: Option<String>,
}

/// Parse `--dump-json` output into [`MediaMetadata`]
pub fn parse_metadata(url: &str, json: &str) -> Result<MediaMetadata> {
    let info: InfoJson = serde_json::from_str(json.trim())?;

    Ok(MediaMetadata {
        title: info.title.unwrap_or_default(),
        artist: info
            .uploader
            .or(info.channel)
            .unwrap_or_else(|| "Unknown".to_string()),
        duration_seconds: info
            .duration
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(|d| d.round() as u32)
            .unwrap_or(0),
        thumbnail_url: info.thumbnail,
        video_id: video_id(url).or(info.id),
    })
}

/// Executor backed by yt-dlp (or anything speaking its output format)
#[derive(Debug, Clone, Default)]
pub struct YtDlpExecutor {
    options: DownloaderOptions,
}

impl YtDlpExecutor {
    pub fn new(options: DownloaderOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &DownloaderOptions {
        &self.options
    }
}

#[async_trait]
impl DownloadExecutor for YtDlpExecutor {
    #[instrument(skip(self, updates), fields(program = %self.options.program))]
    async fn run(&self, job_id: i64, url: &str, updates: mpsc::Sender<DownloadUpdate>) -> Result<PathBuf> {
        let args = self.options.download_args(job_id, url);
        debug!(?args, "Spawning downloader");

        let mut child = Command::new(&self.options.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SyncError::Download(format!("failed to start {}: {}", self.options.program, e)))?;

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "media_sync::downloader", "{}", line);
                }
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut parser = TranscriptParser::new();
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                trace!(target: "media_sync::downloader", "{}", line);
                if let Some(update) = parser.parse_line(&line) {
                    // The receiver only goes away if the job was abandoned
                    let _ = updates.send(update).await;
                }
            }
        }

        let status = child.wait().await?;
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        match status.code() {
            Some(0) => {}
            Some(code) => return Err(SyncError::Download(format!("downloader exited with code {}", code))),
            None => return Err(SyncError::Download("downloader was terminated by a signal".to_string())),
        }

        let output = self.options.output_path(job_id);
        if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
            warn!(path = %output.display(), "Downloader exited cleanly but produced no file");
            return Err(SyncError::Download(format!(
                "expected output '{}' was not produced",
                output.display()
            )));
        }

        info!(path = %output.display(), "Download finished");
        Ok(output)
    }

    async fn probe_metadata(&self, url: &str) -> Result<MediaMetadata> {
        let output = Command::new(&self.options.program)
            .args(self.options.metadata_args(url))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SyncError::Download(format!("failed to start {}: {}", self.options.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr.trim();
            return Err(SyncError::Download(if message.is_empty() {
                "metadata lookup failed".to_string()
            } else {
                message.to_string()
            }));
        }

        parse_metadata(url, &String::from_utf8_lossy(&output.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_download_args() {
        let options = DownloaderOptions {
            temp_dir: PathBuf::from("/tmp"),
            extra_args: vec!["--js-runtimes".to_string(), "node".to_string()],
            ..Default::default()
        };

        assert_eq!(
            options.download_args(7, "https://youtu.be/dQw4w9WgXcQ"),
            vec![
                "-x",
                "--audio-format",
                "mp3",
                "--audio-quality",
                "128K",
                "--add-metadata",
                "--no-playlist",
                "--progress",
                "--newline",
                "-o",
                "/tmp/media-sync-7.%(ext)s",
                "--js-runtimes",
                "node",
                "https://youtu.be/dQw4w9WgXcQ",
            ]
        );
        assert_eq!(options.output_path(7), PathBuf::from("/tmp/media-sync-7.mp3"));
    }

    #[test]
    fn test_parse_metadata() {
        let json = r#"{"id":"dQw4w9WgXcQ","title":"Never Gonna Give You Up","uploader":"Rick Astley",
            "duration":212.6,"thumbnail":"https://i.ytimg.com/vi/dQw4w9WgXcQ/maxresdefault.jpg","formats":[]}"#;
        let metadata = parse_metadata("https://www.youtube.com/watch?v=dQw4w9WgXcQ", json).unwrap();

        assert_eq!(metadata.title, "Never Gonna Give You Up");
        assert_eq!(metadata.artist, "Rick Astley");
        assert_eq!(metadata.duration_seconds, 213);
        assert_eq!(metadata.video_id.as_deref(), Some("dQw4w9WgXcQ"));
        assert!(metadata.thumbnail_url.is_some());

        let sparse = parse_metadata("https://example.com/a.mp3", r#"{"channel":"Someone"}"#).unwrap();
        assert_eq!(sparse.artist, "Someone");
        assert_eq!(sparse.duration_seconds, 0);
        assert_eq!(sparse.video_id, None);

        assert!(parse_metadata("https://example.com", "not json").is_err());
    }

    /// Shell stand-in that prints a yt-dlp style transcript and writes the output file
    const FAKE_DOWNLOADER: &str = r#"
out=""
while [ $# -gt 0 ]; do
    case "$1" in
        -o) out="$2"; shift ;;
    esac
    shift
done
case "$out" in
    *fail*) echo "ERROR: unavailable" >&2; exit 3 ;;
esac
echo "[download] Destination: ${out}"
echo "[download]  12.5% of    3.21MiB at    1.02MiB/s ETA 00:02"
echo "[download] 100% of    3.21MiB in 00:00:03 at 1.05MiB/s"
target=$(printf '%s' "$out" | sed 's/%(ext)s/mp3/')
echo "[ExtractAudio] Destination: ${target}"
printf 'id3' > "$target"
"#;

    fn shell_executor(dir: &TempDir, temp_dir: PathBuf) -> YtDlpExecutor {
        let script = dir.path().join("fake-downloader.sh");
        std::fs::write(&script, FAKE_DOWNLOADER).unwrap();
        YtDlpExecutor::new(DownloaderOptions {
            program: "sh".to_string(),
            program_args: vec![script.to_string_lossy().into_owned()],
            temp_dir,
            ..Default::default()
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_process_and_streams_progress() {
        let dir = TempDir::new().unwrap();
        let executor = shell_executor(&dir, dir.path().to_path_buf());
        let (tx, mut rx) = mpsc::channel(16);

        let output = executor.run(4, "https://youtu.be/dQw4w9WgXcQ", tx).await.unwrap();
        assert_eq!(output, dir.path().join("media-sync-4.mp3"));
        assert_eq!(std::fs::read(&output).unwrap(), b"id3");

        let mut updates = Vec::new();
        while let Some(update) = rx.recv().await {
            updates.push(update);
        }
        assert_eq!(
            updates,
            vec![
                DownloadUpdate::downloading(13),
                DownloadUpdate::downloading(100),
                DownloadUpdate::converting(),
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_download_error() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("fail");
        std::fs::create_dir_all(&temp).unwrap();
        let executor = shell_executor(&dir, temp);
        let (tx, _rx) = mpsc::channel(16);

        let err = executor.run(5, "https://youtu.be/dQw4w9WgXcQ", tx).await.unwrap_err();
        match err {
            SyncError::Download(message) => assert_eq!(message, "downloader exited with code 3"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_download_error() {
        let executor = YtDlpExecutor::new(DownloaderOptions {
            program: "media-sync-no-such-downloader".to_string(),
            ..Default::default()
        });
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            executor.run(1, "https://example.com", tx).await,
            Err(SyncError::Download(_))
        ));
    }
}
