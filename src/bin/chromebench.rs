use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chromebench::config::{BenchSettings, ProcessTableBackend, default_config_path};
use chromebench::harness::{HarnessOptions, TestHarness};
use chromebench::probe::SystemProbes;
use chromebench::registry::{catalog, filter_tests, required_videos};
use chromebench::report::{render_environment, render_summary, write_json_report};
use chromebench::session::BrowserSession;
use chromebench::telemetry::{current_trace_file, init_tracing};
use chromebench::video_cache::VideoCache;
use clap::{ArgAction, Parser, value_parser};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "chromebench",
    version,
    about = "Chromium benchmark harness with CPU sampling",
    long_about = None
)]
struct Cli {
    /// Comma-separated list of tests to run (default: all).
    #[arg(long, value_delimiter = ',')]
    include: Vec<String>,

    /// Comma-separated list of tests to skip.
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// Run Chromium without a visible window.
    #[arg(long, action = ArgAction::SetTrue)]
    headless: bool,

    /// Print the available tests and exit.
    #[arg(long, action = ArgAction::SetTrue)]
    list: bool,

    /// Download every benchmark video into the cache and exit.
    #[arg(long, action = ArgAction::SetTrue)]
    download_videos: bool,

    /// Process table used to attribute CPU usage to the browser.
    #[arg(long, value_enum)]
    process_table: Option<ProcessTableBackend>,

    /// Override the default configuration path.
    #[arg(long, value_parser = value_parser!(PathBuf))]
    config: Option<PathBuf>,

    /// Increase logging verbosity.
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Also write the run as JSON to this path.
    #[arg(long, value_parser = value_parser!(PathBuf))]
    json_report: Option<PathBuf>,

    /// Extra Chromium switches, e.g. `-- --enable-features=Vulkan use-gl=angle`.
    #[arg(last = true)]
    chrome_flags: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => default_config_path()?,
    };
    let mut settings = BenchSettings::load_or_default(&config_path)?;
    init_tracing(cli.verbose, &settings.traces)?;
    info!(path = %config_path.display(), "using config");
    if let Some(trace) = current_trace_file() {
        info!(path = %trace.display(), "writing trace file");
    }

    if cli.headless {
        settings.browser.headless = true;
    }
    if let Some(backend) = cli.process_table {
        settings.sampling.process_table = backend;
    }
    settings.browser.flags.extend(cli.chrome_flags.iter().cloned());

    println!("{}", banner());

    let cache = VideoCache::open(&settings.videos)?;

    if cli.download_videos {
        info!(dir = %cache.cache_dir().display(), "downloading benchmark videos");
        cache.ensure_all()?;
        println!("All videos cached in {}", cache.cache_dir().display());
        return Ok(());
    }

    let family = settings.sampling.browser_family();
    let all_tests = catalog(&cache, &family)?;

    if cli.list {
        println!("Available tests:");
        for test in &all_tests {
            println!("  {}", test.name());
        }
        return Ok(());
    }

    let tests = filter_tests(all_tests, &cli.include, &cli.exclude);
    if tests.is_empty() {
        bail!("No tests selected; run with --list to see available tests");
    }

    let videos = required_videos(&tests);
    if !videos.is_empty() {
        cache
            .ensure(&videos)
            .context("Failed to prepare benchmark videos")?;
    }

    let options = HarnessOptions::from_settings(&settings.harness, &settings.sampling);
    let idle_timeout = options.test_timeout + options.cancel_grace;
    let session = BrowserSession::launch(&settings.browser, idle_timeout)
        .context("Failed to start browser session")?;
    let environment = match session.environment() {
        Ok(environment) => environment,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "unable to read browser environment");
            Default::default()
        }
    };
    print!("{}", render_environment(&environment));

    let probes = Arc::new(SystemProbes::from_settings(&settings.sampling));
    let harness = TestHarness::new(Arc::new(session), tests, probes, options);
    let results = harness.run_all_with(|index, name| {
        if index > 0 {
            println!();
        }
        println!("Running test: {name}");
    });

    println!();
    print!("{}", render_summary(&results));

    if let Some(path) = &cli.json_report {
        write_json_report(path, &environment, &results)?;
        info!(path = %path.display(), "wrote JSON report");
    }

    Ok(())
}

fn banner() -> String {
    format!(
        "chromebench {} ({}/{})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
