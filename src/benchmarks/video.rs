use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::wait_for_condition;
use crate::context::ExecutionContext;
use crate::harness::BenchTest;
use crate::probe::{ProcessFamily, UsageScope};
use crate::result::TestResult;
use crate::session::{BrowserSession, evaluate_json};

const MIN_PLAYBACK: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const WARMUP: Duration = Duration::from_secs(2);

const VIDEO_READY: &str = "!!document.getElementById('video')";
const VIDEO_ENDED: &str = "document.getElementById('video').ended";
const STATS_SCRIPT: &str = "JSON.stringify(window.getVideoStats())";

/// Local video playback benchmark.
#[derive(Debug, Clone)]
pub struct VideoTest {
    name: String,
    video_url: String,
    resolution: String,
    family: ProcessFamily,
}

/// Playback statistics reported by the page.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoStats {
    pub duration: Option<f64>,
    pub current_time: f64,
    pub ended: bool,
    pub decoded_frames: u64,
    pub dropped_frames: u64,
    pub corrupted_frames: u64,
    pub errors: Vec<Value>,
    pub video_width: u32,
    pub video_height: u32,
}

impl VideoStats {
    pub fn drop_rate_percent(&self) -> f64 {
        if self.decoded_frames == 0 {
            return 0.0;
        }
        self.dropped_frames as f64 / self.decoded_frames as f64 * 100.0
    }

    /// Playback errors that invalidate a run.
    ///
    /// Stalls and buffering waits are recorded but not fatal, and the initial
    /// `waiting` event at time zero is expected while the file loads.
    pub fn critical_errors(&self) -> Vec<&Value> {
        self.errors
            .iter()
            .filter(|event| {
                let kind = event.get("type").and_then(Value::as_str);
                let at = event.get("time").and_then(Value::as_f64).unwrap_or(0.0);
                match kind {
                    Some("waiting") if at == 0.0 => false,
                    Some("video_error") => true,
                    _ => false,
                }
            })
            .collect()
    }
}

impl VideoTest {
    pub fn new(
        name: impl Into<String>,
        video_url: impl Into<String>,
        resolution: impl Into<String>,
        family: ProcessFamily,
    ) -> Self {
        Self {
            name: name.into(),
            video_url: video_url.into(),
            resolution: resolution.into(),
            family,
        }
    }

    fn execute(&self, ctx: &ExecutionContext<BrowserSession>) -> Result<VideoStats> {
        let mut page = tempfile::Builder::new()
            .prefix("video-test-")
            .suffix(".html")
            .tempfile()
            .context("Failed to create video test page")?;
        page.write_all(render_page(&self.resolution, &self.video_url).as_bytes())
            .context("Failed to write video test page")?;
        page.flush()?;
        let page_url = url::Url::from_file_path(page.path())
            .map_err(|_| anyhow::anyhow!("Video page path is not absolute"))?;

        let tab = ctx.session().open_tab(ctx.remaining())?;
        tab.navigate_to(page_url.as_str())
            .with_context(|| format!("Failed to open {page_url}"))?
            .wait_until_navigated()?;
        wait_for_condition(ctx, &tab, VIDEO_READY, Duration::from_millis(250))?;
        ctx.sleep(WARMUP)?;

        info!(video = %self.video_url, "video playback started");
        let started = Instant::now();
        while started.elapsed() < MIN_PLAYBACK {
            ctx.sleep(POLL_INTERVAL)?;
            let ended = tab
                .evaluate(VIDEO_ENDED, false)
                .context("Failed to poll playback state")?
                .value
                .and_then(|value| value.as_bool())
                .unwrap_or(false);
            if ended {
                debug!("video ended before the minimum playback window");
                break;
            }
        }

        let stats: VideoStats =
            evaluate_json(&tab, STATS_SCRIPT).context("Failed to get video stats")?;
        Ok(stats)
    }

    fn record(&self, stats: &VideoStats, result: &mut TestResult) {
        let metrics = &mut result.metrics;
        metrics.insert("video_url", self.video_url.as_str());
        metrics.insert("resolution", self.resolution.as_str());
        match stats.duration {
            Some(duration) => metrics.insert("duration", duration),
            None => metrics.insert("duration", Value::Null),
        }
        metrics.insert("decoded_frames", stats.decoded_frames as i64);
        metrics.insert("dropped_frames", stats.dropped_frames as i64);
        metrics.insert("corrupted_frames", stats.corrupted_frames as i64);
        metrics.insert("drop_rate_percent", stats.drop_rate_percent());
        metrics.insert("video_width", i64::from(stats.video_width));
        metrics.insert("video_height", i64::from(stats.video_height));
        metrics.insert("errors", Value::Array(stats.errors.clone()));
    }
}

impl BenchTest<BrowserSession> for VideoTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn usage_scope(&self) -> UsageScope {
        UsageScope::Family(self.family.clone())
    }

    fn run(&self, ctx: &ExecutionContext<BrowserSession>) -> Result<TestResult> {
        let mut result = TestResult::begin(self.name.as_str());
        let stats = match self.execute(ctx) {
            Ok(stats) => stats,
            Err(err) => {
                result.finish_err(format!("{err:#}"));
                return Ok(result);
            }
        };

        self.record(&stats, &mut result);
        let critical = stats.critical_errors();
        if critical.is_empty() {
            result.finish_ok();
        } else {
            let rendered: Vec<String> = critical.iter().map(|event| event.to_string()).collect();
            result.finish_err(format!("video playback errors: [{}]", rendered.join(", ")));
        }
        Ok(result)
    }
}

fn render_page(resolution: &str, video_url: &str) -> String {
    let source = serde_json::to_string(video_url).unwrap_or_else(|_| "\"\"".to_string());
    PAGE_TEMPLATE
        .replace("{{RESOLUTION}}", resolution)
        .replace("{{SOURCE}}", &source)
}

const PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Video Test - {{RESOLUTION}}</title>
    <style>
        body { margin: 0; padding: 20px; background: #000; }
        video { width: 100%; max-width: 1920px; display: block; margin: 0 auto; }
        #stats { color: white; font-family: monospace; margin-top: 20px; }
    </style>
</head>
<body>
    <video id="video" controls autoplay muted></video>
    <div id="stats"></div>
    <script>
        const video = document.getElementById('video');
        const stats = document.getElementById('stats');
        const errors = [];
        let playbackStarted = false;

        video.src = {{SOURCE}};
        video.play().catch(e => console.error('Autoplay failed:', e));

        function updateStats() {
            const quality = video.getVideoPlaybackQuality ? video.getVideoPlaybackQuality() : {};
            const decoded = quality.totalVideoFrames || 0;
            const dropped = quality.droppedVideoFrames || 0;
            stats.innerHTML =
                'Duration: ' + video.duration.toFixed(2) + 's<br>' +
                'Current Time: ' + video.currentTime.toFixed(2) + 's<br>' +
                'Decoded Frames: ' + decoded + '<br>' +
                'Dropped Frames: ' + dropped + '<br>' +
                'Drop Rate: ' + (decoded > 0 ? (dropped / decoded * 100).toFixed(2) : 0) + '%<br>' +
                'Errors: ' + errors.length;
            if (!video.ended && playbackStarted) {
                requestAnimationFrame(updateStats);
            }
        }

        video.addEventListener('playing', () => {
            playbackStarted = true;
            updateStats();
        });
        video.addEventListener('error', () => {
            errors.push({
                type: 'video_error',
                message: video.error ? video.error.message : 'Unknown error',
                code: video.error ? video.error.code : -1
            });
        });
        video.addEventListener('stalled', () => errors.push({type: 'stalled', time: video.currentTime}));
        video.addEventListener('waiting', () => errors.push({type: 'waiting', time: video.currentTime}));

        window.getVideoStats = () => {
            const quality = video.getVideoPlaybackQuality ? video.getVideoPlaybackQuality() : {};
            return {
                duration: isFinite(video.duration) ? video.duration : null,
                currentTime: video.currentTime,
                ended: video.ended,
                decodedFrames: quality.totalVideoFrames || 0,
                droppedFrames: quality.droppedVideoFrames || 0,
                corruptedFrames: quality.corruptedVideoFrames || 0,
                errors: errors,
                videoWidth: video.videoWidth,
                videoHeight: video.videoHeight
            };
        };
    </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stats_with_errors(errors: Vec<Value>) -> VideoStats {
        VideoStats {
            decoded_frames: 1800,
            dropped_frames: 18,
            errors,
            ..VideoStats::default()
        }
    }

    #[test]
    fn drop_rate_is_percentage_of_decoded() {
        let stats = stats_with_errors(Vec::new());
        assert!((stats.drop_rate_percent() - 1.0).abs() < 1e-9);
        assert_eq!(VideoStats::default().drop_rate_percent(), 0.0);
    }

    #[test]
    fn initial_waiting_and_stalls_are_not_critical() {
        let stats = stats_with_errors(vec![
            json!({"type": "waiting", "time": 0}),
            json!({"type": "stalled", "time": 3.5}),
            json!({"type": "waiting", "time": 12.0}),
        ]);
        assert!(stats.critical_errors().is_empty());
    }

    #[test]
    fn decode_errors_are_critical() {
        let stats = stats_with_errors(vec![
            json!({"type": "waiting", "time": 0}),
            json!({"type": "video_error", "message": "DEMUXER_ERROR", "code": 4}),
        ]);
        let critical = stats.critical_errors();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0]["code"], 4);
    }

    #[test]
    fn stats_deserialize_from_page_payload() {
        let raw = r#"{"duration":60.0,"currentTime":30.2,"ended":false,"decodedFrames":906,
            "droppedFrames":2,"corruptedFrames":0,"errors":[],"videoWidth":1280,"videoHeight":720}"#;
        let stats: VideoStats = serde_json::from_str(raw).unwrap();
        assert_eq!(stats.duration, Some(60.0));
        assert_eq!(stats.decoded_frames, 906);
        assert_eq!(stats.video_width, 1280);
    }

    #[test]
    fn recorded_metrics_cover_playback_fields() {
        let test = VideoTest::new(
            "video-720p30-h264",
            "file:///tmp/3dtunnel_720p30_h264.mp4",
            "1280x720",
            ProcessFamily::chromium(),
        );
        let mut result = TestResult::begin(test.name());
        test.record(&stats_with_errors(Vec::new()), &mut result);

        for key in [
            "video_url",
            "resolution",
            "duration",
            "decoded_frames",
            "dropped_frames",
            "corrupted_frames",
            "drop_rate_percent",
            "video_width",
            "video_height",
            "errors",
        ] {
            assert!(result.metrics.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn page_embeds_escaped_source() {
        let page = render_page("1280x720", "file:///tmp/it's.mp4");
        assert!(page.contains("Video Test - 1280x720"));
        assert!(page.contains(r#"video.src = "file:///tmp/it's.mp4";"#));
    }
}
