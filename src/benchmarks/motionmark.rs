use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::wait_for_condition;
use crate::context::ExecutionContext;
use crate::harness::BenchTest;
use crate::probe::{ProcessFamily, UsageScope};
use crate::result::TestResult;
use crate::session::{BrowserSession, evaluate_json};

const MOTIONMARK_URL: &str = "https://browserbench.org/MotionMark/";

const INTRO_VISIBLE: &str = r#"(() => {
    const el = document.querySelector('#intro');
    return !!el && el.offsetParent !== null;
})()"#;

const RESULTS_VISIBLE: &str = r#"(() => {
    const el = document.querySelector('#results');
    return !!el && el.offsetParent !== null;
})()"#;

const SCORE_SCRIPT: &str = r#"(() => {
    const scoreElement = document.querySelector('.score-text');
    if (scoreElement) {
        return JSON.stringify(parseFloat(scoreElement.textContent) || 0);
    }
    const resultsElement = document.querySelector('#results');
    if (resultsElement) {
        const match = resultsElement.textContent.match(/Score:\s*(\d+\.?\d*)/);
        if (match) return JSON.stringify(parseFloat(match[1]));
    }
    return JSON.stringify(0);
})()"#;

const SUBSCORE_SCRIPT: &str = r#"(() => {
    const scores = {};
    document.querySelectorAll('tr.test-row').forEach(row => {
        const name = row.querySelector('.test-name');
        const score = row.querySelector('.score');
        if (name && score) {
            scores[name.textContent.trim()] = parseFloat(score.textContent);
        }
    });
    document.querySelectorAll('.detailed-results tr').forEach(row => {
        const cells = row.querySelectorAll('td');
        if (cells.length >= 2) {
            const name = cells[0].textContent.trim();
            const value = parseFloat(cells[cells.length - 1].textContent.trim());
            if (!isNaN(value) && name) {
                scores[name] = value;
            }
        }
    });
    return JSON.stringify(scores);
})()"#;

/// The MotionMark graphics benchmark from browserbench.org.
#[derive(Debug, Clone)]
pub struct MotionMarkTest {
    url: String,
    family: ProcessFamily,
}

impl MotionMarkTest {
    pub fn new(family: ProcessFamily) -> Self {
        Self {
            url: MOTIONMARK_URL.to_string(),
            family,
        }
    }

    fn execute(
        &self,
        ctx: &ExecutionContext<BrowserSession>,
        result: &mut TestResult,
    ) -> Result<()> {
        let tab = ctx.session().open_tab(ctx.remaining())?;

        tab.navigate_to(&self.url)
            .with_context(|| format!("Failed to navigate to {}", self.url))?
            .wait_until_navigated()?;
        wait_for_condition(ctx, &tab, INTRO_VISIBLE, Duration::from_millis(250))
            .context("MotionMark intro never became visible")?;

        info!("starting MotionMark run");
        tab.evaluate("benchmarkController.startBenchmark()", false)
            .context("Failed to start MotionMark")?;

        // A full run takes several minutes.
        wait_for_condition(ctx, &tab, RESULTS_VISIBLE, Duration::from_secs(2))
            .context("MotionMark did not finish")?;

        let score: f64 = evaluate_json(&tab, SCORE_SCRIPT).context("Failed to read score")?;
        let subscores: BTreeMap<String, Option<f64>> =
            evaluate_json(&tab, SUBSCORE_SCRIPT).context("Failed to read subscores")?;
        debug!(score, subscores = subscores.len(), "MotionMark results extracted");

        result.metrics.insert("overall_score", score);
        for (name, value) in subscores {
            match value {
                Some(value) => result.metrics.insert(format!("subscore_{name}"), value),
                None => result.metrics.insert(format!("subscore_{name}"), "NaN"),
            }
        }
        Ok(())
    }
}

impl Default for MotionMarkTest {
    fn default() -> Self {
        Self::new(ProcessFamily::chromium())
    }
}

impl BenchTest<BrowserSession> for MotionMarkTest {
    fn name(&self) -> &str {
        "motionmark"
    }

    fn usage_scope(&self) -> UsageScope {
        UsageScope::Family(self.family.clone())
    }

    fn run(&self, ctx: &ExecutionContext<BrowserSession>) -> Result<TestResult> {
        let mut result = TestResult::begin(self.name());
        match self.execute(ctx, &mut result) {
            Ok(()) => result.finish_ok(),
            Err(err) => result.finish_err(format!("{err:#}")),
        }
        Ok(result)
    }
}
