//! Transcoding.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};
use vingest_models::{ChecksumHasher, TranscodeJob};
use vingest_storage::ArtifactStore;

use crate::config::{RenditionSpec, WorkerConfig};
use crate::error::{WorkerError, WorkerResult};

/// Read buffer for copying sources out of and renditions into the artifact store.
const COPY_BUFFER_SIZE: usize = 1024 * 1024;
/// Stderr kept from a failed ffmpeg run.
const STDERR_TAIL: usize = 2048;

/// One produced rendition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenditionOutput {
    pub name: String,
    pub location: String,
    pub size_bytes: u64,
}

/// Everything a transcode produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscodeOutput {
    pub renditions: Vec<RenditionOutput>,
}

impl TranscodeOutput {
    pub fn locations(&self) -> Vec<String> {
        self.renditions.iter().map(|r| r.location.clone()).collect()
    }
}

/// Turns a source artifact into renditions.
///
/// Implementations must be safe to re-run for the same job: outputs are
/// keyed by video id, so a retry overwrites rather than duplicates.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, job: &TranscodeJob) -> WorkerResult<TranscodeOutput>;
}

/// Builder for one ffmpeg invocation.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    input: PathBuf,
    output: PathBuf,
    output_args: Vec<String>,
    log_level: String,
}

impl FfmpegCommand {
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            output_args: Vec::new(),
            log_level: "error".to_string(),
        }
    }

    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn video_filter(self, filter: impl Into<String>) -> Self {
        self.output_arg("-vf").output_arg(filter)
    }

    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:v").output_arg(codec)
    }

    pub fn video_bitrate(self, bitrate: impl Into<String>) -> Self {
        self.output_arg("-b:v").output_arg(bitrate)
    }

    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:a").output_arg(codec)
    }

    pub fn preset(self, preset: impl Into<String>) -> Self {
        self.output_arg("-preset").output_arg(preset)
    }

    /// Move the moov atom to the front for progressive playback.
    pub fn faststart(self) -> Self {
        self.output_arg("-movflags").output_arg("+faststart")
    }

    /// Standard H.264/AAC rendition at `spec`'s height.
    pub fn rendition(input: impl AsRef<Path>, output: impl AsRef<Path>, spec: &RenditionSpec) -> Self {
        Self::new(input, output)
            // even width keeps libx264 happy
            .video_filter(format!("scale=-2:{}", spec.height))
            .video_codec("libx264")
            .preset("veryfast")
            .video_bitrate(spec.video_bitrate.clone())
            .audio_codec("aac")
            .faststart()
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-v".to_string(),
            self.log_level.clone(),
            "-i".to_string(),
            self.input.to_string_lossy().to_string(),
        ];
        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().to_string());
        args
    }
}

/// Stream the job's source artifact to `path`, checking size and checksum.
///
/// The copy stops as soon as it runs past the expected size.
pub(crate) async fn fetch_source(
    artifacts: &dyn ArtifactStore,
    job: &TranscodeJob,
    path: &Path,
) -> WorkerResult<()> {
    let mut reader = artifacts.open(&job.source_location).await?;
    let mut file = tokio::fs::File::create(path).await?;
    let mut hasher = ChecksumHasher::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        if hasher.len() > job.size_bytes {
            return Err(WorkerError::invalid_source(format!(
                "source exceeds the expected {} bytes",
                job.size_bytes
            )));
        }
        file.write_all(&buf[..n]).await?;
    }
    file.flush().await?;

    if hasher.len() != job.size_bytes {
        return Err(WorkerError::invalid_source(format!(
            "source is {} bytes, expected {}",
            hasher.len(),
            job.size_bytes
        )));
    }
    if hasher.finalize() != job.checksum {
        return Err(WorkerError::invalid_source("source checksum mismatch"));
    }
    Ok(())
}

/// Transcoder that shells out to the ffmpeg CLI.
pub struct FfmpegTranscoder {
    artifacts: Arc<dyn ArtifactStore>,
    ffmpeg: PathBuf,
    renditions: Vec<RenditionSpec>,
    work_dir: PathBuf,
    output_prefix: String,
    timeout: Duration,
}

impl FfmpegTranscoder {
    /// Locate ffmpeg in PATH and build the transcoder.
    pub fn new(artifacts: Arc<dyn ArtifactStore>, config: &WorkerConfig) -> WorkerResult<Self> {
        let ffmpeg = which::which("ffmpeg").map_err(|_| WorkerError::FfmpegNotFound)?;
        if config.renditions.is_empty() {
            return Err(WorkerError::config_error("no renditions configured"));
        }
        Ok(Self {
            artifacts,
            ffmpeg,
            renditions: config.renditions.clone(),
            work_dir: PathBuf::from(&config.work_dir),
            output_prefix: config.output_prefix.clone(),
            timeout: config.job_timeout,
        })
    }

    /// Artifact key for one rendition of a video.
    pub fn output_key(&self, job: &TranscodeJob, rendition: &RenditionSpec) -> String {
        format!("{}/{}/{}.mp4", self.output_prefix, job.video_id, rendition.name)
    }

    async fn run(&self, cmd: &FfmpegCommand) -> WorkerResult<()> {
        let args = cmd.build_args();
        debug!("Running FFmpeg: ffmpeg {}", args.join(" "));

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stderr = child.stderr.take();
        let collect_stderr = async move {
            let mut buf = String::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        };

        let waited = tokio::time::timeout(self.timeout, async {
            let (status, stderr) = tokio::join!(child.wait(), collect_stderr);
            (status, stderr)
        })
        .await;

        let (status, stderr) = match waited {
            Ok(done) => done,
            Err(_) => {
                warn!("FFmpeg timed out after {} seconds, killing process", self.timeout.as_secs());
                let _ = child.kill().await;
                return Err(WorkerError::Timeout(self.timeout.as_secs()));
            }
        };

        let status = status?;
        if status.success() {
            return Ok(());
        }

        let tail_start = stderr.len().saturating_sub(STDERR_TAIL);
        let tail = stderr.get(tail_start..).unwrap_or(&stderr).trim();
        // ffmpeg exits 1 for unreadable input as well as for runtime faults
        if tail.contains("Invalid data found when processing input") {
            return Err(WorkerError::invalid_source(tail.to_string()));
        }
        Err(WorkerError::transcode_failed(format!(
            "ffmpeg exited with {:?}: {}",
            status.code(),
            tail
        )))
    }

    async fn store_output(&self, key: &str, path: &Path) -> WorkerResult<(String, u64)> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut writer = self.artifacts.create(key).await?;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut total = 0u64;

        loop {
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    writer.abort().await;
                    return Err(e.into());
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = writer.append(&buf[..n]).await {
                writer.abort().await;
                return Err(e.into());
            }
            total += n as u64;
        }

        let location = writer.finish().await?;
        Ok((location, total))
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, job: &TranscodeJob) -> WorkerResult<TranscodeOutput> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-", job.job_id))
            .tempdir_in(&self.work_dir)?;

        let source = scratch.path().join("source");
        fetch_source(self.artifacts.as_ref(), job, &source).await?;

        let mut output = TranscodeOutput::default();
        for spec in &self.renditions {
            let target = scratch.path().join(format!("{}.mp4", spec.name));
            self.run(&FfmpegCommand::rendition(&source, &target, spec))
                .await?;

            let key = self.output_key(job, spec);
            let (location, size_bytes) = self.store_output(&key, &target).await?;
            info!(
                job_id = %job.job_id,
                rendition = %spec.name,
                size_bytes,
                "Stored rendition"
            );
            output.renditions.push(RenditionOutput {
                name: spec.name.clone(),
                location,
                size_bytes,
            });
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vingest_models::{Checksum, CompletionEvent, SessionId, VideoId};
    use vingest_storage::MemoryArtifactStore;

    async fn stored_source(data: &[u8]) -> (MemoryArtifactStore, String) {
        let store = MemoryArtifactStore::new();
        let mut writer = store.create("raw/v1.bin").await.unwrap();
        writer.append(data).await.unwrap();
        let location = writer.finish().await.unwrap();
        (store, location)
    }

    fn job_for(location: &str, checksum: Checksum, size_bytes: u64) -> TranscodeJob {
        TranscodeJob::from_completion(&CompletionEvent {
            session_id: SessionId::from("s1"),
            video_id: VideoId::from_string("v1"),
            artifact_location: location.to_string(),
            checksum,
            size_bytes,
        })
    }

    #[tokio::test]
    async fn test_fetch_source_streams_verified_copy() {
        // spans several copy buffers
        let data: Vec<u8> = (0..COPY_BUFFER_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
        let (store, location) = stored_source(&data).await;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("source");

        let job = job_for(&location, Checksum::compute(&data), data.len() as u64);
        fetch_source(&store, &job, &path).await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_fetch_source_rejects_size_and_checksum_mismatch() {
        let (store, location) = stored_source(b"0123456789").await;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("source");

        let short = job_for(&location, Checksum::compute(b"0123456789"), 4);
        let err = fetch_source(&store, &short, &path).await.unwrap_err();
        assert!(err.is_permanent_failure());
        assert!(err.to_string().contains("exceeds"));

        let long = job_for(&location, Checksum::compute(b"0123456789"), 11);
        let err = fetch_source(&store, &long, &path).await.unwrap_err();
        assert!(err.to_string().contains("10 bytes"));

        let tampered = job_for(&location, Checksum::compute(b"9876543210"), 10);
        let err = fetch_source(&store, &tampered, &path).await.unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[tokio::test]
    async fn test_fetch_source_missing_artifact_is_storage_error() {
        let store = MemoryArtifactStore::new();
        let dir = TempDir::new().unwrap();
        let job = job_for("mem://raw/gone.bin", Checksum::compute(b"x"), 1);

        let err = fetch_source(&store, &job, &dir.path().join("source"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Storage(_)));
    }

    #[test]
    fn test_rendition_args() {
        let spec = RenditionSpec::new("720p", 720, "2500k");
        let args = FfmpegCommand::rendition("/tmp/in", "/tmp/out.mp4", &spec).build_args();

        assert_eq!(&args[..5], ["-y", "-v", "error", "-i", "/tmp/in"]);
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
        let vf = args.iter().position(|a| a == "-vf").unwrap();
        assert_eq!(args[vf + 1], "scale=-2:720");
        let bv = args.iter().position(|a| a == "-b:v").unwrap();
        assert_eq!(args[bv + 1], "2500k");
    }

    #[test]
    fn test_output_locations() {
        let output = TranscodeOutput {
            renditions: vec![
                RenditionOutput {
                    name: "720p".to_string(),
                    location: "mem://renditions/v1/720p.mp4".to_string(),
                    size_bytes: 10,
                },
                RenditionOutput {
                    name: "480p".to_string(),
                    location: "mem://renditions/v1/480p.mp4".to_string(),
                    size_bytes: 5,
                },
            ],
        };
        assert_eq!(
            output.locations(),
            vec![
                "mem://renditions/v1/720p.mp4".to_string(),
                "mem://renditions/v1/480p.mp4".to_string()
            ]
        );
    }
}
