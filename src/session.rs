use std::{
    collections::BTreeMap,
    env,
    ffi::{OsStr, OsString},
    ops::Deref,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use headless_chrome::protocol::cdp::Browser::GetBrowserCommandLine;
use headless_chrome::protocol::cdp::types::Method;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::BrowserSettings;
use crate::report::EnvironmentInfo;

/// Switches applied to every benchmark session.
const BASE_FLAGS: &[&str] = &[
    "--disable-blink-features=AutomationControlled",
    "--disable-dev-shm-usage",
    "--no-sandbox",
    "--autoplay-policy=no-user-gesture-required",
];

const BINARY_ENV: &str = "CHROMEBENCH_CHROME_BINARY";

/// Upper bound for a single blocking protocol call on a tab.
pub const DRIVER_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Normalise a user-supplied Chromium switch to `--key` or `--key=value`.
pub fn normalize_flag(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches('-');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.split_once('=') {
        Some((key, value)) if !key.is_empty() => Some(format!("--{key}={value}")),
        Some(_) => None,
        None => Some(format!("--{trimmed}")),
    }
}

/// Base switches plus the caller's extras, without duplicates.
pub fn merge_flags(extra: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = BASE_FLAGS.iter().map(|flag| flag.to_string()).collect();
    for flag in extra.iter().filter_map(|raw| normalize_flag(raw)) {
        let key = flag.split('=').next().unwrap_or(&flag).to_string();
        merged.retain(|existing| existing.split('=').next() != Some(key.as_str()));
        merged.push(flag);
    }
    merged
}

/// Locate a Chromium-compatible binary.
pub fn resolve_binary(settings: &BrowserSettings) -> Result<PathBuf> {
    if let Some(path) = &settings.binary_path {
        return Ok(path.clone());
    }
    if let Ok(path) = env::var(BINARY_ENV) {
        return Ok(PathBuf::from(path));
    }
    let candidates = [
        "chromium",
        "chromium-browser",
        "google-chrome",
        "google-chrome-stable",
        "chrome",
    ];
    for candidate in candidates {
        if let Ok(path) = which::which(candidate) {
            return Ok(path);
        }
    }
    bail!(
        "Chromium-compatible binary not found; set {BINARY_ENV} or configure browser.binary_path"
    )
}

/// The single browser instance shared by every test in a run.
pub struct BrowserSession {
    browser: Browser,
    flags: Vec<String>,
}

impl BrowserSession {
    /// Launch Chromium. Failure here is fatal for the whole run.
    pub fn launch(settings: &BrowserSettings, idle_timeout: Duration) -> Result<Self> {
        let binary = resolve_binary(settings)?;
        let flags = merge_flags(&settings.flags);
        let os_flags: Vec<OsString> = flags.iter().map(OsString::from).collect();
        let args: Vec<&OsStr> = os_flags.iter().map(OsString::as_os_str).collect();

        info!(
            binary = %binary.display(),
            headless = settings.headless,
            flags = ?flags,
            "launching browser"
        );

        let options = LaunchOptions::default_builder()
            .path(Some(binary.clone()))
            .headless(settings.headless)
            .sandbox(false)
            .window_size(Some((settings.window_width, settings.window_height)))
            .idle_browser_timeout(idle_timeout)
            .args(args)
            .build()
            .map_err(|err| anyhow!("invalid browser launch options: {err}"))?;

        let browser = Browser::new(options)
            .with_context(|| format!("Failed to launch browser {}", binary.display()))?;
        Ok(Self { browser, flags })
    }

    /// Open a fresh tab, closed again when the guard drops.
    ///
    /// Each protocol call gives up after `budget` or [`DRIVER_CALL_TIMEOUT`],
    /// whichever is shorter.
    pub fn open_tab(&self, budget: Duration) -> Result<PageGuard<Tab>> {
        let tab = self.browser.new_tab().context("Failed to open browser tab")?;
        tab.set_default_timeout(budget.min(DRIVER_CALL_TIMEOUT));
        Ok(PageGuard::new(tab))
    }

    /// Browser version, command line and GPU details.
    pub fn environment(&self) -> Result<EnvironmentInfo> {
        let version = self
            .browser
            .get_version()
            .context("Failed to query browser version")?;

        let mut info = EnvironmentInfo {
            product: version.product,
            revision: version.revision,
            user_agent: version.user_agent,
            flags: self.flags.clone(),
            ..EnvironmentInfo::default()
        };

        let tab = self.open_tab(DRIVER_CALL_TIMEOUT)?;
        match tab.call_method(GetBrowserCommandLine(None)) {
            Ok(reply) => info.command_line = reply.arguments,
            Err(err) => debug!(error = %err, "browser command line unavailable"),
        }
        match tab.call_method(SystemInfoQuery {}) {
            Ok(reply) => {
                if info.command_line.is_empty() && !reply.command_line.is_empty() {
                    info.command_line = vec![reply.command_line];
                }
                reply.gpu.apply_to(&mut info);
            }
            Err(err) => debug!(error = %err, "system info unavailable"),
        }

        if info.gpu_vendor.is_none() && info.gpu_device.is_none() {
            match webgl_identity(&tab) {
                Ok(gpu) => {
                    info.gpu_vendor = gpu.vendor;
                    info.gpu_device = gpu.renderer;
                }
                Err(err) => warn!(error = %format!("{err:#}"), "unable to read GPU information"),
            }
        }
        debug!(
            vendor = ?info.gpu_vendor,
            device = ?info.gpu_device,
            features = info.gpu_feature_status.len(),
            "gpu identity"
        );
        Ok(info)
    }
}

/// A page that can be closed by whoever holds it.
pub trait ClosePage {
    fn close_page(&self) -> Result<()>;
}

impl ClosePage for Tab {
    fn close_page(&self) -> Result<()> {
        self.close(false).map(|_| ())
    }
}

/// Owns an open page and closes it on every exit path.
pub struct PageGuard<P: ClosePage> {
    page: Arc<P>,
}

impl<P: ClosePage> PageGuard<P> {
    pub fn new(page: Arc<P>) -> Self {
        Self { page }
    }
}

impl<P: ClosePage> Deref for PageGuard<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.page
    }
}

impl<P: ClosePage> Drop for PageGuard<P> {
    fn drop(&mut self) {
        if let Err(err) = self.page.close_page() {
            debug!(error = %err, "failed to close page");
        }
    }
}

/// `SystemInfo.getInfo`, decoded by hand so the free-form feature map survives.
#[derive(Debug, Serialize)]
struct SystemInfoQuery {}

impl Method for SystemInfoQuery {
    const NAME: &'static str = "SystemInfo.getInfo";
    type ReturnObject = SystemInfoReply;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemInfoReply {
    #[serde(default)]
    gpu: GpuInfoReply,
    #[serde(default)]
    command_line: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GpuInfoReply {
    #[serde(default)]
    devices: Vec<GpuDeviceReply>,
    #[serde(default)]
    feature_status: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GpuDeviceReply {
    #[serde(default)]
    vendor_string: String,
    #[serde(default)]
    device_string: String,
    #[serde(default)]
    driver_version: String,
}

impl GpuInfoReply {
    /// The first device is the active one.
    fn apply_to(self, info: &mut EnvironmentInfo) {
        if let Some(device) = self.devices.into_iter().next() {
            info.gpu_vendor = non_empty(device.vendor_string);
            info.gpu_device = non_empty(device.device_string);
            info.gpu_driver_version = non_empty(device.driver_version);
        }
        info.gpu_feature_status = self
            .feature_status
            .into_iter()
            .map(|(feature, status)| {
                let status = match status {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                (feature, status)
            })
            .collect();
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn webgl_identity(tab: &Tab) -> Result<GpuIdentity> {
    tab.navigate_to("about:blank")?.wait_until_navigated()?;
    evaluate_json(tab, GPU_PROBE_SCRIPT)
}

const GPU_PROBE_SCRIPT: &str = r#"
(() => {
    const canvas = document.createElement('canvas');
    const gl = canvas.getContext('webgl2') || canvas.getContext('webgl');
    if (!gl) {
        return JSON.stringify({ vendor: null, renderer: null });
    }
    const ext = gl.getExtension('WEBGL_debug_renderer_info');
    return JSON.stringify({
        vendor: ext ? gl.getParameter(ext.UNMASKED_VENDOR_WEBGL) : gl.getParameter(gl.VENDOR),
        renderer: ext ? gl.getParameter(ext.UNMASKED_RENDERER_WEBGL) : gl.getParameter(gl.RENDERER),
    });
})()
"#;

#[derive(Debug, Deserialize)]
struct GpuIdentity {
    vendor: Option<String>,
    renderer: Option<String>,
}

/// Evaluate a script that returns `JSON.stringify(...)` and decode the payload.
pub fn evaluate_json<T>(tab: &Tab, script: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let object = tab
        .evaluate(script, true)
        .context("Failed to evaluate page script")?;
    let raw = object
        .value
        .and_then(|value| value.as_str().map(str::to_owned))
        .context("Page script did not return a JSON string")?;
    serde_json::from_str(&raw).context("Page script returned malformed JSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn normalize_flag_handles_dashes_and_values() {
        assert_eq!(normalize_flag("enable-gpu"), Some("--enable-gpu".into()));
        assert_eq!(normalize_flag("--enable-gpu"), Some("--enable-gpu".into()));
        assert_eq!(
            normalize_flag("-use-gl=angle"),
            Some("--use-gl=angle".into())
        );
        assert_eq!(
            normalize_flag("--enable-features=A,B=C"),
            Some("--enable-features=A,B=C".into())
        );
        assert_eq!(normalize_flag("--"), None);
        assert_eq!(normalize_flag("=value"), None);
    }

    #[test]
    fn merge_flags_overrides_base_switches() {
        let merged = merge_flags(&[
            "disable-blink-features=Foo".to_string(),
            "ignore-gpu-blocklist".to_string(),
        ]);
        assert!(merged.contains(&"--disable-blink-features=Foo".to_string()));
        assert!(!merged.contains(&"--disable-blink-features=AutomationControlled".to_string()));
        assert!(merged.contains(&"--ignore-gpu-blocklist".to_string()));
        assert!(merged.contains(&"--no-sandbox".to_string()));
    }

    #[test]
    fn explicit_binary_path_wins() {
        let settings = BrowserSettings {
            binary_path: Some(PathBuf::from("/opt/chromium/chrome")),
            ..BrowserSettings::default()
        };
        assert_eq!(
            resolve_binary(&settings).unwrap(),
            PathBuf::from("/opt/chromium/chrome")
        );
    }

    struct CountingPage {
        closes: AtomicUsize,
    }

    impl ClosePage for CountingPage {
        fn close_page(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn open_and_fail(page: &Arc<CountingPage>) -> Result<()> {
        let tab = PageGuard::new(Arc::clone(page));
        if tab.closes.load(Ordering::SeqCst) == 0 {
            bail!("navigation failed");
        }
        Ok(())
    }

    #[test]
    fn page_is_closed_when_a_benchmark_bails_early() {
        let page = Arc::new(CountingPage {
            closes: AtomicUsize::new(0),
        });
        assert!(open_and_fail(&page).is_err());
        assert_eq!(page.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn page_close_failure_is_swallowed() {
        struct BrokenPage;
        impl ClosePage for BrokenPage {
            fn close_page(&self) -> Result<()> {
                bail!("target already gone")
            }
        }
        drop(PageGuard::new(Arc::new(BrokenPage)));
    }

    #[test]
    fn system_info_reply_fills_gpu_fields() {
        let reply: SystemInfoReply = serde_json::from_value(serde_json::json!({
            "gpu": {
                "devices": [
                    {
                        "vendorId": 32902,
                        "deviceId": 18086,
                        "vendorString": "Intel",
                        "deviceString": "ANGLE (Intel, Mesa Intel(R) Xe Graphics)",
                        "driverVendor": "Mesa",
                        "driverVersion": "24.1.2"
                    },
                    { "vendorId": 0, "deviceId": 0, "vendorString": "", "deviceString": "",
                      "driverVendor": "", "driverVersion": "" }
                ],
                "featureStatus": {
                    "webgl": "enabled",
                    "gpu_compositing": "enabled",
                    "vulkan": "disabled_off"
                },
                "driverBugWorkarounds": [],
                "videoDecoding": [],
                "videoEncoding": [],
                "imageDecoding": []
            },
            "modelName": "",
            "modelVersion": "",
            "commandLine": "/usr/lib/chromium/chromium --headless"
        }))
        .unwrap();
        assert_eq!(reply.command_line, "/usr/lib/chromium/chromium --headless");

        let mut info = EnvironmentInfo::default();
        reply.gpu.apply_to(&mut info);
        assert_eq!(info.gpu_vendor.as_deref(), Some("Intel"));
        assert_eq!(info.gpu_driver_version.as_deref(), Some("24.1.2"));
        let features: Vec<&str> = info.gpu_feature_status.keys().map(String::as_str).collect();
        assert_eq!(features, vec!["gpu_compositing", "vulkan", "webgl"]);
        assert_eq!(info.gpu_feature_status["vulkan"], "disabled_off");
    }

    #[test]
    fn missing_devices_leave_gpu_unknown() {
        let reply: SystemInfoReply =
            serde_json::from_value(serde_json::json!({ "gpu": { "devices": [] } })).unwrap();
        let mut info = EnvironmentInfo::default();
        reply.gpu.apply_to(&mut info);
        assert!(info.gpu_vendor.is_none());
        assert!(info.gpu_feature_status.is_empty());
    }
}
