//! Loadplan — a small, composable load-test plan runner for Rust.
//!
//! Loadplan borrows the test-plan shape popularized by JMeter (thread groups,
//! samplers, scoped configuration and listeners) and runs it natively on
//! Tokio. You assemble an immutable plan tree once, run it, and get back a
//! per-label statistics snapshot.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`TestPlan`]: the root of the configuration tree and the run entry
//!   point. Immutable once built; the same plan can be run repeatedly.
//! - [`ThreadGroup`]: a pool of virtual users, all replaying the same ordered
//!   sequence of children for a fixed number of iterations.
//! - [`HttpSampler`]: one measured HTTP unit of work, producing exactly one
//!   [`SampleResult`] per invocation. Failures are data (a failed result),
//!   never control flow.
//! - [`HttpHeaders`]: a header manager. Applies to the samplers that follow
//!   it in its scope and to nested scopes; nearer declarations win on
//!   conflicting names.
//! - [`Listener`]: consumer of completed results. Built-ins: the statistics
//!   collector feeding [`TestPlanStats`], and the results-file writer
//!   ([`jtl_writer`]), each scoped to the subtree it is attached to.
//! - [`Transport`]: the protocol seam samplers execute through. Defaults to
//!   a shared reqwest client; tests swap in stubs for deterministic runs.
//!
//! # Example
//!
//! ```rust,no_run
//! use loadplan::{http_sampler, jtl_writer, test_plan, thread_group};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stats = test_plan([
//!         thread_group(
//!             10,
//!             50,
//!             [
//!                 http_sampler("http://localhost:3000/")
//!                     .label("home")
//!                     .into(),
//!                 http_sampler("http://localhost:3000/search")
//!                     .label("search")
//!                     .into(),
//!             ],
//!         )
//!         .into(),
//!         jtl_writer("results.jtl").into(),
//!     ])
//!     .run()
//!     .await?;
//!
//!     println!(
//!         "{} samples, {} errors, mean {:?}",
//!         stats.overall().samples_count(),
//!         stats.overall().error_count(),
//!         stats.overall().mean_time(),
//!     );
//!     println!("home: {:?}", stats.by_label("home"));
//!     Ok(())
//! }
//! ```
//!
//! # Execution model
//!
//! Each virtual user is one Tokio task; a group's users start together and
//! run their sampler sequence strictly in order, iteration after iteration.
//! Results from different users interleave arbitrarily at listeners, but
//! each listener sees one user's results in completion order. `run` resolves
//! the tree first (build errors surface before anything executes), then
//! blocks until every user has finished or a stop signal was observed at a
//! sampler boundary (see [`StopHandle`] and [`RunSettings`]).

/// Error taxonomy: build, run, listener, and transport errors.
pub mod error;
/// Thread-group scheduling and sampler execution.
pub mod executor;
/// Result listeners and the results-file writer.
pub mod listener;
/// The immutable test-plan tree, validation, and run settings.
pub mod plan;
/// Sample results and the pluggable transport.
pub mod sample;
/// Statistics aggregation and the final run snapshot.
pub mod stats;

pub use error::{BuildError, ListenerError, RunError, TransportError};
pub use executor::StopHandle;
pub use listener::{JtlWriter, Listener};
pub use plan::{
    GroupChild, HttpHeaders, HttpSampler, JtlWriterConfig, ListenerFailure, PlanChild,
    RunSettings, SamplerChild, TestPlan, ThreadGroup,
};
pub use sample::{
    HttpTransport, Method, RequestRecord, ResponseRecord, SampleResult, Transport,
    TransportRequest, TransportResponse,
};
pub use stats::{RunWarning, StatsSummary, TestPlanStats};

use std::path::PathBuf;

/// Builds a test plan from its ordered children.
pub fn test_plan(children: impl IntoIterator<Item = PlanChild>) -> TestPlan {
    TestPlan::new(children)
}

/// Builds a thread group: `threads` virtual users each running the child
/// sequence `iterations` times.
pub fn thread_group(
    threads: u32,
    iterations: u32,
    children: impl IntoIterator<Item = GroupChild>,
) -> ThreadGroup {
    ThreadGroup::new(threads, iterations, children)
}

/// Builds a `GET` sampler for the given target; label defaults to the URL.
pub fn http_sampler(url: impl Into<String>) -> HttpSampler {
    HttpSampler::new(url)
}

/// Builds an empty header manager; chain [`HttpHeaders::header`] to fill it.
pub fn http_headers() -> HttpHeaders {
    HttpHeaders::new()
}

/// Declares a results-file writer for the scope it is attached to.
pub fn jtl_writer(path: impl Into<PathBuf>) -> JtlWriterConfig {
    JtlWriterConfig { path: path.into() }
}
