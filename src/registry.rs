//! The benchmark catalog and name-based selection.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Result, anyhow};

use crate::benchmarks::{MotionMarkTest, VideoTest};
use crate::harness::BenchTest;
use crate::probe::ProcessFamily;
use crate::session::BrowserSession;
use crate::video_cache::{VideoCache, VideoInfo, find_video, test_videos};

pub type BrowserTest = Arc<dyn BenchTest<BrowserSession>>;

/// Every known benchmark, MotionMark first and then the video catalog.
pub fn catalog(cache: &VideoCache, family: &ProcessFamily) -> Result<Vec<BrowserTest>> {
    let mut tests: Vec<BrowserTest> = vec![Arc::new(MotionMarkTest::new(family.clone()))];
    for video in test_videos() {
        let path = cache.video_path(video);
        let url = url::Url::from_file_path(&path)
            .map_err(|_| anyhow!("Video cache path {} is not absolute", path.display()))?;
        tests.push(Arc::new(VideoTest::new(
            video.name,
            url.as_str(),
            video.resolution,
            family.clone(),
        )));
    }
    Ok(tests)
}

fn name_set(names: &[String]) -> HashSet<String> {
    names
        .iter()
        .flat_map(|entry| entry.split(','))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Keep tests named in `include` (all when empty) and drop anything in
/// `exclude`. Order is preserved.
pub fn filter_tests<S>(
    tests: Vec<Arc<dyn BenchTest<S>>>,
    include: &[String],
    exclude: &[String],
) -> Vec<Arc<dyn BenchTest<S>>> {
    let include = name_set(include);
    let exclude = name_set(exclude);
    tests
        .into_iter()
        .filter(|test| include.is_empty() || include.contains(test.name()))
        .filter(|test| !exclude.contains(test.name()))
        .collect()
}

/// Catalog videos backing the selected tests.
pub fn required_videos<S>(tests: &[Arc<dyn BenchTest<S>>]) -> Vec<VideoInfo> {
    tests
        .iter()
        .filter_map(|test| find_video(test.name()))
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VideoSettings;
    use crate::context::ExecutionContext;
    use crate::probe::UsageScope;
    use crate::result::TestResult;
    use tempfile::tempdir;

    struct Named(&'static str);

    impl BenchTest<()> for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn usage_scope(&self) -> UsageScope {
            UsageScope::Machine
        }

        fn run(&self, _ctx: &ExecutionContext<()>) -> anyhow::Result<TestResult> {
            Ok(TestResult::begin(self.0))
        }
    }

    fn tests(names: &[&'static str]) -> Vec<Arc<dyn BenchTest<()>>> {
        names
            .iter()
            .map(|name| Arc::new(Named(*name)) as Arc<dyn BenchTest<()>>)
            .collect()
    }

    fn names(tests: &[Arc<dyn BenchTest<()>>]) -> Vec<String> {
        tests.iter().map(|test| test.name().to_string()).collect()
    }

    #[test]
    fn empty_include_selects_everything() {
        let selected = filter_tests(tests(&["a", "b", "c"]), &[], &[]);
        assert_eq!(names(&selected), ["a", "b", "c"]);
    }

    #[test]
    fn include_is_trimmed_and_comma_separated() {
        let selected = filter_tests(tests(&["a", "b", "c"]), &[" c , a ".to_string()], &[]);
        assert_eq!(names(&selected), ["a", "c"]);
    }

    #[test]
    fn exclude_wins_over_include() {
        let selected = filter_tests(
            tests(&["a", "b", "c"]),
            &["a".to_string(), "b".to_string()],
            &["b".to_string()],
        );
        assert_eq!(names(&selected), ["a"]);
    }

    #[test]
    fn unknown_names_select_nothing() {
        let selected = filter_tests(tests(&["a"]), &["missing".to_string()], &[]);
        assert!(selected.is_empty());
    }

    #[test]
    fn required_videos_ignores_non_video_tests() {
        let selected = tests(&["motionmark", "video-720p60-h264", "video-hawaii-240p24-h264"]);
        let videos = required_videos(&selected);
        let wanted: Vec<&str> = videos.iter().map(|video| video.name).collect();
        assert_eq!(wanted, ["video-720p60-h264", "video-hawaii-240p24-h264"]);
    }

    #[test]
    fn catalog_points_video_tests_at_cached_files() {
        let dir = tempdir().unwrap();
        let cache = VideoCache::with_dir(dir.path().join("videos"), &VideoSettings::default())
            .unwrap();
        let all = catalog(&cache, &ProcessFamily::chromium()).unwrap();

        assert_eq!(all.len(), 1 + test_videos().len());
        assert_eq!(all[0].name(), "motionmark");
        assert_eq!(all[1].name(), "video-240p30-h264");
        assert!(all.iter().all(|test| test.usage_scope() != UsageScope::Machine));
    }
}
