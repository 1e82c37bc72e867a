pub mod benchmarks;
pub mod config;
pub mod context;
pub mod harness;
pub mod probe;
pub mod registry;
pub mod report;
pub mod result;
pub mod sampler;
pub mod session;
pub mod telemetry;
pub mod video_cache;

pub use context::{ContextError, ExecutionContext};
pub use harness::{BenchTest, HarnessOptions, TestHarness};
pub use probe::{ProbeProvider, ProcessFamily, SystemProbes, UsageProbe, UsageScope};
pub use result::{MetricValue, Metrics, TestResult};
pub use sampler::{Sample, Sampler, SamplerError, SamplerState};
