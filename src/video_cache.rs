use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use tracing::{info, warn};

use crate::config::VideoSettings;

const PROGRESS_STEP: u64 = 1024 * 1024;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    pub name: &'static str,
    pub url: &'static str,
    pub resolution: &'static str,
}

macro_rules! video {
    ($name:literal, $file:literal, $resolution:literal) => {
        VideoInfo {
            name: $name,
            url: concat!(
                "https://github.com/jsando/videos-for-testing/releases/download/v1.0/",
                $file
            ),
            resolution: $resolution,
        }
    };
}

const TEST_VIDEOS: &[VideoInfo] = &[
    video!("video-240p30-h264", "3dtunnel_240p30_h264.mp4", "426x240"),
    video!("video-240p60-h264", "3dtunnel_240p60_h264.mp4", "426x240"),
    video!("video-720p30-h264", "3dtunnel_720p30_h264.mp4", "1280x720"),
    video!("video-720p60-h264", "3dtunnel_720p60_h264.mp4", "1280x720"),
    video!("video-1080p30-h264", "3dtunnel_1080p30_h264.mp4", "1920x1080"),
    video!("video-1080p60-h264", "3dtunnel_1080p60_h264.mp4", "1920x1080"),
    video!("video-2160p30-h264", "3dtunnel_2160p30_h264.mp4", "3840x2160"),
    video!("video-2160p60-h264", "3dtunnel_2160p60_h264.mp4", "3840x2160"),
    video!("video-hawaii-240p24-h264", "hawaii-ocean-sunrise-240p24_h264.mp4", "426x240"),
    video!("video-hawaii-720p24-h264", "hawaii-ocean-sunrise-720p24_h264.mp4", "1280x720"),
    video!("video-hawaii-1080p24-h264", "hawaii-ocean-sunrise-1080p24_h264.mp4", "1920x1080"),
    video!("video-hawaii-2160p24-h264", "hawaii-ocean-sunrise-2160p24_h264.mp4", "3840x2160"),
];

pub fn test_videos() -> &'static [VideoInfo] {
    TEST_VIDEOS
}

pub fn find_video(name: &str) -> Option<&'static VideoInfo> {
    let needle = name.trim();
    if needle.is_empty() {
        return None;
    }
    TEST_VIDEOS
        .iter()
        .find(|video| video.name.eq_ignore_ascii_case(needle))
}

/// On-disk cache of benchmark videos.
#[derive(Debug, Clone)]
pub struct VideoCache {
    cache_dir: PathBuf,
    attempts: u32,
    timeout: Duration,
}

impl VideoCache {
    pub fn open(settings: &VideoSettings) -> Result<Self> {
        let cache_dir = settings.resolve_cache_dir()?;
        Self::with_dir(cache_dir, settings)
    }

    pub fn with_dir(cache_dir: PathBuf, settings: &VideoSettings) -> Result<Self> {
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("Failed to create video cache {}", cache_dir.display()))?;
        Ok(Self {
            cache_dir,
            attempts: settings.download_attempts.max(1),
            timeout: Duration::from_secs(settings.download_timeout_secs.max(1)),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Local path for a video; the last URL segment is the file name.
    pub fn video_path(&self, video: &VideoInfo) -> PathBuf {
        let file_name = video
            .url
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .unwrap_or(video.name);
        self.cache_dir.join(file_name)
    }

    pub fn is_cached(&self, video: &VideoInfo) -> bool {
        fs::metadata(self.video_path(video))
            .map(|metadata| metadata.is_file() && metadata.len() > 0)
            .unwrap_or(false)
    }

    /// Download every catalog video that is not cached yet.
    pub fn ensure_all(&self) -> Result<()> {
        self.ensure(TEST_VIDEOS)
    }

    pub fn ensure(&self, videos: &[VideoInfo]) -> Result<()> {
        let missing: Vec<&VideoInfo> = videos
            .iter()
            .filter(|video| !self.is_cached(video))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .context("Failed to build download client")?;
        for video in &missing {
            self.download_with_retry(&client, video)
                .with_context(|| format!("Failed to download {}", video.name))?;
        }
        info!(count = missing.len(), dir = %self.cache_dir.display(), "all videos cached");
        Ok(())
    }

    fn download_with_retry(&self, client: &Client, video: &VideoInfo) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.download(client, video) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.attempts => {
                    warn!(
                        video = video.name,
                        attempt,
                        error = %format!("{err:#}"),
                        "download failed; retrying"
                    );
                    thread::sleep(RETRY_BACKOFF * attempt);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn download(&self, client: &Client, video: &VideoInfo) -> Result<()> {
        let local_path = self.video_path(video);
        let tmp_path = tmp_path_for(&local_path);
        info!(video = video.name, url = video.url, "downloading video");

        let response = client
            .get(video.url)
            .send()
            .with_context(|| format!("Request to {} failed", video.url))?;
        if !response.status().is_success() {
            bail!("bad status: {}", response.status());
        }
        let total = response.content_length();

        let written = write_atomically(&local_path, &tmp_path, |file| {
            let mut reader = ProgressReader::new(response, video.name, total);
            io::copy(&mut reader, file).context("Download interrupted")
        })?;

        info!(video = video.name, bytes = written, "downloaded video");
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|name| name.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Fill `tmp_path` through `fill`, then rename it over `path`. The temp file is
/// removed on any failure.
fn write_atomically<F>(path: &Path, tmp_path: &Path, fill: F) -> Result<u64>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<u64>,
{
    let outcome = (|| -> Result<u64> {
        let file = File::create(tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        let mut writer = BufWriter::new(file);
        let written = fill(&mut writer)?;
        writer.flush()?;
        drop(writer);
        fs::rename(tmp_path, path).with_context(|| {
            format!("Failed to move {} to {}", tmp_path.display(), path.display())
        })?;
        Ok(written)
    })();

    if outcome.is_err() {
        let _ = fs::remove_file(tmp_path);
    }
    outcome
}

struct ProgressReader<R> {
    inner: R,
    name: &'static str,
    total: Option<u64>,
    downloaded: u64,
    last_report: u64,
}

impl<R> ProgressReader<R> {
    fn new(inner: R, name: &'static str, total: Option<u64>) -> Self {
        Self {
            inner,
            name,
            total,
            downloaded: 0,
            last_report: 0,
        }
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.downloaded += read as u64;
        let finished = read == 0 || Some(self.downloaded) == self.total;
        if self.downloaded - self.last_report >= PROGRESS_STEP || finished {
            self.last_report = self.downloaded;
            if let Some(total) = self.total.filter(|total| *total > 0) {
                info!(
                    video = self.name,
                    percent = format_args!("{:.1}", self.downloaded as f64 / total as f64 * 100.0),
                    downloaded_mb = format_args!("{:.1}", self.downloaded as f64 / 1_048_576.0),
                    total_mb = format_args!("{:.1}", total as f64 / 1_048_576.0),
                    "download progress"
                );
            }
        }
        Ok(read)
    }
}
