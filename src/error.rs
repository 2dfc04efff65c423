use std::path::PathBuf;

use thiserror::Error;

use crate::stats::TestPlanStats;

/// Configuration problems detected while a test plan is being resolved,
/// before any thread is started.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("test plan contains no thread groups")]
    EmptyPlan,
    #[error("thread group `{0}` must have at least one thread")]
    NoThreads(String),
    #[error("thread group `{0}` must run at least one iteration")]
    NoIterations(String),
    #[error("thread group `{0}` contains no samplers")]
    NoSamplers(String),
    #[error("sampler `{label}` has an invalid target url `{url}`: {reason}")]
    InvalidUrl {
        label: String,
        url: String,
        reason: String,
    },
}

/// Errors surfaced by the run entry point.
///
/// Sampler-level failures (timeouts, refused connections, non-2xx responses)
/// are *not* errors: they become failed [`SampleResult`]s and show up in the
/// statistics. Only structural problems end up here. Variants raised after
/// sampling began carry the statistics collected up to the failure.
///
/// [`SampleResult`]: crate::sample::SampleResult
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("could not open results file `{path}`")]
    ResultsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("listener `{listener}` aborted the run: {source}")]
    ListenerAborted {
        listener: String,
        #[source]
        source: ListenerError,
        /// Statistics collected before the abort took effect.
        partial: TestPlanStats,
    },
    #[error("worker task failed: {message}")]
    WorkerFailed {
        message: String,
        /// Statistics collected by the workers that did finish.
        partial: TestPlanStats,
    },
}

/// Failure of a single listener while processing one result.
///
/// Depending on [`ListenerFailure`] these are either collected as run
/// warnings or escalated to [`RunError::ListenerAborted`].
///
/// [`ListenerFailure`]: crate::plan::ListenerFailure
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Transport-level outcome of one request that never produced a response.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Other(String),
}
