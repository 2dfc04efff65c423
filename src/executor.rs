//! Execution core: thread-group scheduling and sampler invocation.
//!
//! Each virtual user is one Tokio task. All tasks are spawned first, gated on
//! a shared start signal so a group's users begin together, then the run
//! entry point joins every handle. A plan-level stop signal is observed at
//! sampler boundaries; it ends remaining iterations without preempting a
//! sampler mid-flight.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{ListenerError, RunError};
use crate::listener::{JtlWriter, Listener};
use crate::plan::{CompiledPlan, CompiledSampler, ListenerDecl, ListenerFailure, RunSettings};
use crate::sample::{RequestRecord, ResponseRecord, SampleResult, Transport, TransportRequest};
use crate::stats::{RunWarning, StatsCollector, TestPlanStats};

/// Handle for stopping a run from outside.
///
/// Pass the receiver to [`RunSettings`] and call [`stop`](Self::stop) to make
/// every virtual user exit at its next sampler boundary.
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// One sampler with its precomputed listener set.
struct RunnableSampler {
    spec: CompiledSampler,
    listeners: Vec<Arc<dyn Listener>>,
}

/// Fatal failure raised while workers were running. Converted into a
/// [`RunError`] once the statistics collected so far have been snapshotted.
enum WorkerFatal {
    ListenerAborted { listener: String, source: ListenerError },
    Join(String),
}

/// State shared by every virtual user of the run.
#[derive(Clone)]
struct ExecutionContext {
    start: watch::Receiver<bool>,
    stop: watch::Receiver<bool>,
    /// Internal abort used when a listener failure escalates.
    abort: Arc<watch::Sender<bool>>,
    transport: Arc<dyn Transport>,
    warnings: Arc<Mutex<Vec<RunWarning>>>,
    on_listener_failure: ListenerFailure,
    stop_thread_on_error: bool,
}

pub(crate) async fn run_plan(
    plan: CompiledPlan,
    settings: RunSettings,
) -> Result<TestPlanStats, RunError> {
    let run_start = Instant::now();

    let mut listeners: Vec<Arc<dyn Listener>> = Vec::with_capacity(plan.listeners.len());
    for decl in &plan.listeners {
        match decl {
            ListenerDecl::File(path) => {
                let writer = JtlWriter::open(path)
                    .await
                    .map_err(|source| RunError::ResultsFile {
                        path: path.clone(),
                        source,
                    })?;
                listeners.push(Arc::new(writer));
            }
            ListenerDecl::Custom(listener) => listeners.push(listener.clone()),
        }
    }

    let stats = Arc::new(StatsCollector::new());
    let (start_tx, start_rx) = watch::channel(false);
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    // Bridge an externally supplied stop signal onto the internal channel.
    if let Some(mut external) = settings.stop {
        let abort = stop_tx.clone();
        tokio::spawn(async move {
            if external.wait_for(|stopped| *stopped).await.is_ok() {
                let _ = abort.send(true);
            }
        });
    }

    let ctx = ExecutionContext {
        start: start_rx,
        stop: stop_rx,
        abort: stop_tx,
        transport: plan.transport.clone(),
        warnings: Arc::new(Mutex::new(Vec::new())),
        on_listener_failure: settings.on_listener_failure,
        stop_thread_on_error: settings.stop_thread_on_error,
    };

    tracing::info!(groups = plan.groups.len(), "spawning thread groups");
    let mut handles: Vec<JoinHandle<Result<(), WorkerFatal>>> = Vec::new();
    for group in plan.groups {
        let samplers: Arc<Vec<RunnableSampler>> = Arc::new(
            group
                .samplers
                .into_iter()
                .map(|spec| {
                    // the collector goes first: an aborting listener must not
                    // lose the result that triggered it
                    let mut applicable: Vec<Arc<dyn Listener>> =
                        Vec::with_capacity(spec.listener_ids.len() + 1);
                    applicable.push(stats.clone());
                    applicable.extend(spec.listener_ids.iter().map(|&id| listeners[id].clone()));
                    RunnableSampler {
                        spec,
                        listeners: applicable,
                    }
                })
                .collect(),
        );

        for thread in 1..=group.threads {
            let thread_name = format!("{}-{}", group.name, thread);
            handles.push(tokio::spawn(thread_worker(
                ctx.clone(),
                samplers.clone(),
                group.iterations,
                thread_name,
            )));
        }
    }

    tracing::info!(threads = handles.len(), "starting virtual users");
    let _ = start_tx.send(true);

    let mut fatal: Option<WorkerFatal> = None;
    for joined in join_all(handles).await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                fatal.get_or_insert(err);
            }
            Err(join_err) => {
                fatal.get_or_insert(WorkerFatal::Join(join_err.to_string()));
            }
        }
    }

    tracing::info!("flushing listeners");
    let mut warnings = std::mem::take(
        &mut *ctx
            .warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner),
    );
    for listener in &listeners {
        if let Err(err) = listener.close().await {
            warnings.push(RunWarning {
                listener: listener.name().to_owned(),
                message: err.to_string(),
            });
        }
    }

    let snapshot = stats.snapshot(warnings, run_start.elapsed());
    if let Some(fatal) = fatal {
        return Err(match fatal {
            WorkerFatal::ListenerAborted { listener, source } => RunError::ListenerAborted {
                listener,
                source,
                partial: snapshot,
            },
            WorkerFatal::Join(message) => RunError::WorkerFailed {
                message,
                partial: snapshot,
            },
        });
    }

    tracing::info!(elapsed = ?run_start.elapsed(), "run complete");
    Ok(snapshot)
}

/// One virtual user: replays the group's sampler sequence for the configured
/// number of iterations, strictly in order, checking the stop signal between
/// samplers.
async fn thread_worker(
    mut ctx: ExecutionContext,
    samplers: Arc<Vec<RunnableSampler>>,
    iterations: u32,
    thread_name: String,
) -> Result<(), WorkerFatal> {
    // wait until every user of the run has been spawned
    let _ = ctx.start.wait_for(|started| *started).await;

    'iterations: for _ in 0..iterations {
        for sampler in samplers.iter() {
            if *ctx.stop.borrow() {
                tracing::debug!(thread = %thread_name, "stop signal observed");
                break 'iterations;
            }

            let result = execute_sampler(&sampler.spec, ctx.transport.as_ref(), &thread_name).await;
            let failed = !result.success;

            for listener in &sampler.listeners {
                if let Err(err) = listener.handle(&result).await {
                    match ctx.on_listener_failure {
                        ListenerFailure::Abort => {
                            let _ = ctx.abort.send(true);
                            return Err(WorkerFatal::ListenerAborted {
                                listener: listener.name().to_owned(),
                                source: err,
                            });
                        }
                        ListenerFailure::ReportAndContinue => {
                            tracing::warn!(listener = listener.name(), error = %err, "listener failed");
                            ctx.warnings
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .push(RunWarning {
                                    listener: listener.name().to_owned(),
                                    message: err.to_string(),
                                });
                        }
                    }
                }
            }

            if failed && ctx.stop_thread_on_error {
                tracing::debug!(thread = %thread_name, "stopping thread after failed sample");
                break 'iterations;
            }
        }
    }

    Ok(())
}

/// Performs exactly one unit of work and renders its outcome as data.
/// Transport failures become failed results, never errors.
async fn execute_sampler(
    spec: &CompiledSampler,
    transport: &dyn Transport,
    thread_name: &str,
) -> SampleResult {
    let request = TransportRequest {
        method: spec.method.clone(),
        url: spec.url.clone(),
        headers: spec.headers.clone(),
        body: spec.body.clone(),
        timeout: spec.timeout,
    };

    let start_millis = unix_millis();
    let started = Instant::now();
    let outcome = transport.send(&request).await;
    let elapsed = started.elapsed();

    let bytes_sent = request.wire_size();
    let record = RequestRecord {
        method: request.method.to_string(),
        url: request.url,
        headers: request.headers,
        body: request.body,
    };

    match outcome {
        Ok(response) => {
            let bytes_received = response.wire_size();
            SampleResult {
                label: spec.label.clone(),
                thread_name: thread_name.to_owned(),
                start_millis,
                elapsed,
                success: response.status < 400,
                request: record,
                response: Some(ResponseRecord {
                    status: response.status,
                    status_text: response.status_text,
                    headers: response.headers,
                    body: response.body,
                }),
                bytes_sent,
                bytes_received,
                error: None,
            }
        }
        Err(err) => SampleResult {
            label: spec.label.clone(),
            thread_name: thread_name.to_owned(),
            start_millis,
            elapsed,
            success: false,
            request: record,
            response: None,
            bytes_sent,
            bytes_received: 0,
            error: Some(err.to_string()),
        },
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
