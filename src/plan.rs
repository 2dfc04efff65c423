//! The immutable test-plan configuration tree and its resolution.
//!
//! A plan is built once, validated and resolved before anything runs, then
//! executed read-only. Resolution precomputes, per sampler, the effective
//! headers (ancestor defaults merged with nearer-scope overrides) and the set
//! of result writers whose scope contains the sampler, so no scope lookup
//! happens on the hot path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use typed_builder::TypedBuilder;

use crate::error::{BuildError, RunError};
use crate::executor;
use crate::listener::Listener;
use crate::sample::{HttpTransport, Method, Transport};
use crate::stats::TestPlanStats;

/// Root of the configuration tree.
///
/// Built via [`test_plan`](crate::test_plan), run via [`TestPlan::run`]. The
/// plan itself stays immutable across runs, so the same plan can be executed
/// repeatedly and yields independent statistics each time.
pub struct TestPlan {
    children: Vec<PlanChild>,
    transport: Option<Arc<dyn Transport>>,
}

/// Direct child of a [`TestPlan`].
pub enum PlanChild {
    ThreadGroup(ThreadGroup),
    Headers(HttpHeaders),
    Writer(JtlWriterConfig),
    Listener(Arc<dyn Listener>),
}

/// A pool of identical virtual users replaying the same child sequence.
pub struct ThreadGroup {
    name: Option<String>,
    threads: u32,
    iterations: u32,
    children: Vec<GroupChild>,
}

/// Direct child of a [`ThreadGroup`]. Order matters for header managers:
/// they apply to the samplers that follow them in the same scope.
pub enum GroupChild {
    Sampler(HttpSampler),
    Headers(HttpHeaders),
    Writer(JtlWriterConfig),
    Listener(Arc<dyn Listener>),
}

/// Child attached directly to a sampler.
pub enum SamplerChild {
    Headers(HttpHeaders),
    Writer(JtlWriterConfig),
    Listener(Arc<dyn Listener>),
}

/// One HTTP unit of work.
///
/// Defaults to `GET` with the target URL as its label.
pub struct HttpSampler {
    label: Option<String>,
    url: String,
    method: Method,
    headers: Vec<(String, String)>,
    body: Option<String>,
    timeout: Option<Duration>,
    children: Vec<SamplerChild>,
}

impl HttpSampler {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            label: None,
            url: url.into(),
            method: Method::GET,
            headers: Vec::new(),
            body: None,
            timeout: None,
            children: Vec::new(),
        }
    }

    /// Label results aggregate under. Defaults to the target URL.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Sets a header on the sampler itself. Overrides any header with the
    /// same name inherited from an enclosing scope.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Switches the sampler to `POST` with the given body and Content-Type.
    pub fn post(mut self, body: impl Into<String>, content_type: impl Into<String>) -> Self {
        self.method = Method::POST;
        self.body = Some(body.into());
        self.headers.push(("Content-Type".into(), content_type.into()));
        self
    }

    /// Per-request timeout; an expired timeout becomes a failed result.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attaches children (header managers, result writers) scoped to this
    /// sampler only.
    pub fn children(mut self, children: impl IntoIterator<Item = SamplerChild>) -> Self {
        self.children.extend(children);
        self
    }
}

/// Header manager: applies its entries to every sampler that follows it in
/// the scope it is declared in, and to samplers in nested scopes.
#[derive(Default)]
pub struct HttpHeaders {
    entries: Vec<(String, String)>,
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.push((name.into(), value.into()));
        self
    }
}

/// Declaration of a results-file writer; the file is opened when the run
/// starts. Scope-wide: position among siblings does not matter. Declarations
/// naming the same path, at any scope, share one writer and one open file.
pub struct JtlWriterConfig {
    pub(crate) path: PathBuf,
}

impl ThreadGroup {
    pub fn new(threads: u32, iterations: u32, children: impl IntoIterator<Item = GroupChild>) -> Self {
        Self {
            name: None,
            threads,
            iterations,
            children: children.into_iter().collect(),
        }
    }

    /// Group name used in thread names and result files. Defaults to
    /// `thread group N` by position.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl From<ThreadGroup> for PlanChild {
    fn from(group: ThreadGroup) -> Self {
        PlanChild::ThreadGroup(group)
    }
}

impl From<HttpHeaders> for PlanChild {
    fn from(headers: HttpHeaders) -> Self {
        PlanChild::Headers(headers)
    }
}

impl From<JtlWriterConfig> for PlanChild {
    fn from(writer: JtlWriterConfig) -> Self {
        PlanChild::Writer(writer)
    }
}

impl From<Arc<dyn Listener>> for PlanChild {
    fn from(listener: Arc<dyn Listener>) -> Self {
        PlanChild::Listener(listener)
    }
}

impl From<HttpSampler> for GroupChild {
    fn from(sampler: HttpSampler) -> Self {
        GroupChild::Sampler(sampler)
    }
}

impl From<HttpHeaders> for GroupChild {
    fn from(headers: HttpHeaders) -> Self {
        GroupChild::Headers(headers)
    }
}

impl From<JtlWriterConfig> for GroupChild {
    fn from(writer: JtlWriterConfig) -> Self {
        GroupChild::Writer(writer)
    }
}

impl From<Arc<dyn Listener>> for GroupChild {
    fn from(listener: Arc<dyn Listener>) -> Self {
        GroupChild::Listener(listener)
    }
}

impl From<HttpHeaders> for SamplerChild {
    fn from(headers: HttpHeaders) -> Self {
        SamplerChild::Headers(headers)
    }
}

impl From<JtlWriterConfig> for SamplerChild {
    fn from(writer: JtlWriterConfig) -> Self {
        SamplerChild::Writer(writer)
    }
}

impl From<Arc<dyn Listener>> for SamplerChild {
    fn from(listener: Arc<dyn Listener>) -> Self {
        SamplerChild::Listener(listener)
    }
}

/// What to do when a listener fails to process a result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListenerFailure {
    /// Collect the failure as a run warning and keep sampling.
    #[default]
    ReportAndContinue,
    /// Abort the whole run.
    Abort,
}

/// Per-run execution settings, separate from the plan so the same plan can
/// run under different policies.
#[derive(TypedBuilder)]
pub struct RunSettings {
    /// Stop signal observed by every virtual user between samplers.
    #[builder(default, setter(strip_option))]
    pub stop: Option<watch::Receiver<bool>>,
    #[builder(default)]
    pub on_listener_failure: ListenerFailure,
    /// When set, a failed sample ends the owning virtual user's remaining
    /// iterations. Off by default: failure is data, not control flow.
    #[builder(default = false)]
    pub stop_thread_on_error: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl TestPlan {
    pub fn new(children: impl IntoIterator<Item = PlanChild>) -> Self {
        Self {
            children: children.into_iter().collect(),
            transport: None,
        }
    }

    /// Replaces the default reqwest transport, mainly to stub out the
    /// network in tests.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Runs the plan to completion and returns the finalized statistics.
    ///
    /// Blocks the calling task until every thread of every group has
    /// finished all its iterations.
    pub async fn run(&self) -> Result<TestPlanStats, RunError> {
        self.run_with(RunSettings::default()).await
    }

    /// Like [`run`](Self::run) with explicit settings (stop signal, failure
    /// policies).
    pub async fn run_with(&self, settings: RunSettings) -> Result<TestPlanStats, RunError> {
        let compiled = self.compile()?;
        executor::run_plan(compiled, settings).await
    }

    /// Validates the plan without running it.
    pub fn validate(&self) -> Result<(), BuildError> {
        self.compile().map(drop)
    }

    /// Resolves the tree into a flat execution plan: per-sampler effective
    /// headers and applicable listener set, computed once.
    pub(crate) fn compile(&self) -> Result<CompiledPlan, BuildError> {
        let mut listeners: Vec<ListenerDecl> = Vec::new();
        let mut plan_listener_ids: Vec<usize> = Vec::new();
        for child in &self.children {
            match child {
                PlanChild::Writer(writer) => {
                    register_writer(&mut listeners, &mut plan_listener_ids, &writer.path);
                }
                PlanChild::Listener(listener) => {
                    plan_listener_ids.push(listeners.len());
                    listeners.push(ListenerDecl::Custom(listener.clone()));
                }
                _ => {}
            }
        }

        let mut groups = Vec::new();
        let mut plan_headers: Vec<(String, String)> = Vec::new();
        let mut group_index = 0;
        for child in &self.children {
            match child {
                PlanChild::Headers(headers) => merge_headers(&mut plan_headers, &headers.entries),
                PlanChild::ThreadGroup(group) => {
                    group_index += 1;
                    groups.push(compile_group(
                        group,
                        group_index,
                        &plan_headers,
                        &plan_listener_ids,
                        &mut listeners,
                    )?);
                }
                PlanChild::Writer(_) | PlanChild::Listener(_) => {}
            }
        }

        if groups.is_empty() {
            return Err(BuildError::EmptyPlan);
        }

        Ok(CompiledPlan {
            groups,
            listeners,
            transport: self
                .transport
                .clone()
                .unwrap_or_else(|| Arc::new(HttpTransport::new())),
        })
    }
}

fn compile_group(
    group: &ThreadGroup,
    position: usize,
    inherited_headers: &[(String, String)],
    plan_listener_ids: &[usize],
    listeners: &mut Vec<ListenerDecl>,
) -> Result<CompiledGroup, BuildError> {
    let name = group
        .name
        .clone()
        .unwrap_or_else(|| format!("thread group {position}"));
    if group.threads == 0 {
        return Err(BuildError::NoThreads(name));
    }
    if group.iterations == 0 {
        return Err(BuildError::NoIterations(name));
    }

    // Listener applicability is scope-wide, so register the group's
    // listeners before walking the ordered children.
    let mut group_listener_ids = plan_listener_ids.to_vec();
    for child in &group.children {
        match child {
            GroupChild::Writer(writer) => {
                register_writer(listeners, &mut group_listener_ids, &writer.path);
            }
            GroupChild::Listener(listener) => {
                group_listener_ids.push(listeners.len());
                listeners.push(ListenerDecl::Custom(listener.clone()));
            }
            _ => {}
        }
    }

    let mut samplers = Vec::new();
    let mut scope_headers = inherited_headers.to_vec();
    for child in &group.children {
        match child {
            GroupChild::Headers(headers) => merge_headers(&mut scope_headers, &headers.entries),
            GroupChild::Sampler(sampler) => {
                samplers.push(compile_sampler(
                    sampler,
                    &scope_headers,
                    &group_listener_ids,
                    listeners,
                )?);
            }
            GroupChild::Writer(_) | GroupChild::Listener(_) => {}
        }
    }

    if samplers.is_empty() {
        return Err(BuildError::NoSamplers(name));
    }

    Ok(CompiledGroup {
        name,
        threads: group.threads,
        iterations: group.iterations,
        samplers,
    })
}

fn compile_sampler(
    sampler: &HttpSampler,
    scope_headers: &[(String, String)],
    scope_listener_ids: &[usize],
    listeners: &mut Vec<ListenerDecl>,
) -> Result<CompiledSampler, BuildError> {
    let label = sampler.label.clone().unwrap_or_else(|| sampler.url.clone());

    if let Err(err) = reqwest::Url::parse(&sampler.url) {
        return Err(BuildError::InvalidUrl {
            label,
            url: sampler.url.clone(),
            reason: err.to_string(),
        });
    }

    let mut headers = scope_headers.to_vec();
    let mut listener_ids = scope_listener_ids.to_vec();
    for child in &sampler.children {
        match child {
            SamplerChild::Headers(managed) => merge_headers(&mut headers, &managed.entries),
            SamplerChild::Writer(writer) => {
                register_writer(listeners, &mut listener_ids, &writer.path);
            }
            SamplerChild::Listener(listener) => {
                listener_ids.push(listeners.len());
                listeners.push(ListenerDecl::Custom(listener.clone()));
            }
        }
    }
    // The sampler's own headers are the most specific scope and win last.
    merge_headers(&mut headers, &sampler.headers);

    Ok(CompiledSampler {
        label,
        method: sampler.method.clone(),
        url: sampler.url.clone(),
        headers,
        body: sampler.body.clone(),
        timeout: sampler.timeout,
        listener_ids,
    })
}

/// Merges `additions` into `headers`, replacing entries whose name matches
/// case-insensitively so nearer-scope values override inherited ones.
fn merge_headers(headers: &mut Vec<(String, String)>, additions: &[(String, String)]) {
    for (name, value) in additions {
        match headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value.clone(),
            None => headers.push((name.clone(), value.clone())),
        }
    }
}

/// Registers a file writer for a scope. Declarations naming the same path
/// reuse one id, so the file is opened once, gets one header, and collects
/// the results of every scope that declared it.
fn register_writer(listeners: &mut Vec<ListenerDecl>, scope_ids: &mut Vec<usize>, path: &Path) {
    let id = listeners
        .iter()
        .position(|decl| matches!(decl, ListenerDecl::File(existing) if existing == path))
        .unwrap_or_else(|| {
            listeners.push(ListenerDecl::File(path.to_path_buf()));
            listeners.len() - 1
        });
    // overlapping scopes must not deliver a result twice
    if !scope_ids.contains(&id) {
        scope_ids.push(id);
    }
}

/// A listener as declared in the tree; file writers are opened when the run
/// starts.
pub(crate) enum ListenerDecl {
    File(PathBuf),
    Custom(Arc<dyn Listener>),
}

/// Flat, fully resolved execution plan.
pub(crate) struct CompiledPlan {
    pub groups: Vec<CompiledGroup>,
    /// All declared listeners; samplers reference them by index.
    pub listeners: Vec<ListenerDecl>,
    pub transport: Arc<dyn Transport>,
}

pub(crate) struct CompiledGroup {
    pub name: String,
    pub threads: u32,
    pub iterations: u32,
    pub samplers: Vec<CompiledSampler>,
}

pub(crate) struct CompiledSampler {
    pub label: String,
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Option<Duration>,
    pub listener_ids: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{http_headers, http_sampler, jtl_writer, test_plan, thread_group};

    fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn group_headers_apply_only_to_following_samplers() {
        let plan = test_plan([thread_group(
            1,
            1,
            [
                http_sampler("http://localhost/a").into(),
                http_headers().header("x-token", "t1").into(),
                http_sampler("http://localhost/b").into(),
            ],
        )
        .into()]);

        let compiled = plan.compile().unwrap();
        let samplers = &compiled.groups[0].samplers;
        assert_eq!(header_value(&samplers[0].headers, "x-token"), None);
        assert_eq!(header_value(&samplers[1].headers, "x-token"), Some("t1"));
    }

    #[test]
    fn sampler_headers_override_inherited_ones() {
        let plan = test_plan([thread_group(
            1,
            1,
            [
                http_headers()
                    .header("x-env", "group")
                    .header("x-keep", "inherited")
                    .into(),
                http_sampler("http://localhost/").header("X-Env", "sampler").into(),
            ],
        )
        .into()]);

        let compiled = plan.compile().unwrap();
        let headers = &compiled.groups[0].samplers[0].headers;
        assert_eq!(header_value(headers, "x-env"), Some("sampler"));
        assert_eq!(header_value(headers, "x-keep"), Some("inherited"));
    }

    #[test]
    fn sampler_child_headers_rank_between_scope_and_explicit() {
        let plan = test_plan([thread_group(
            1,
            1,
            [http_sampler("http://localhost/")
                .header("a", "explicit")
                .children([http_headers()
                    .header("a", "child")
                    .header("b", "child")
                    .into()])
                .into()],
        )
        .into()]);

        let compiled = plan.compile().unwrap();
        let headers = &compiled.groups[0].samplers[0].headers;
        assert_eq!(header_value(headers, "a"), Some("explicit"));
        assert_eq!(header_value(headers, "b"), Some("child"));
    }

    #[test]
    fn plan_writer_applies_to_all_samplers_regardless_of_position() {
        let plan = test_plan([
            thread_group(1, 1, [http_sampler("http://localhost/").into()]).into(),
            jtl_writer("/tmp/results.jtl").into(),
        ]);

        let compiled = plan.compile().unwrap();
        assert_eq!(compiled.listeners.len(), 1);
        assert_eq!(compiled.groups[0].samplers[0].listener_ids, vec![0]);
    }

    #[test]
    fn sampler_writer_is_not_shared_with_siblings() {
        let plan = test_plan([thread_group(
            1,
            1,
            [
                http_sampler("http://localhost/a")
                    .children([jtl_writer("/tmp/a.jtl").into()])
                    .into(),
                http_sampler("http://localhost/b").into(),
            ],
        )
        .into()]);

        let compiled = plan.compile().unwrap();
        let samplers = &compiled.groups[0].samplers;
        assert_eq!(samplers[0].listener_ids, vec![0]);
        assert!(samplers[1].listener_ids.is_empty());
    }

    #[test]
    fn writers_declaring_the_same_path_share_one_instance() {
        let plan = test_plan([
            thread_group(
                1,
                1,
                [
                    http_sampler("http://localhost/a").into(),
                    jtl_writer("/tmp/shared.jtl").into(),
                ],
            )
            .into(),
            thread_group(
                1,
                1,
                [
                    http_sampler("http://localhost/b").into(),
                    jtl_writer("/tmp/shared.jtl").into(),
                ],
            )
            .into(),
        ]);

        let compiled = plan.compile().unwrap();
        assert_eq!(compiled.listeners.len(), 1);
        assert_eq!(compiled.groups[0].samplers[0].listener_ids, vec![0]);
        assert_eq!(compiled.groups[1].samplers[0].listener_ids, vec![0]);
    }

    #[test]
    fn overlapping_scopes_on_one_path_deliver_once() {
        let plan = test_plan([
            jtl_writer("/tmp/shared.jtl").into(),
            thread_group(
                1,
                1,
                [
                    http_sampler("http://localhost/").into(),
                    jtl_writer("/tmp/shared.jtl").into(),
                ],
            )
            .into(),
        ]);

        let compiled = plan.compile().unwrap();
        assert_eq!(compiled.listeners.len(), 1);
        assert_eq!(compiled.groups[0].samplers[0].listener_ids, vec![0]);
    }

    #[test]
    fn default_label_is_the_target_url() {
        let plan = test_plan([thread_group(
            1,
            1,
            [http_sampler("http://localhost/x").into()],
        )
        .into()]);
        let compiled = plan.compile().unwrap();
        assert_eq!(compiled.groups[0].samplers[0].label, "http://localhost/x");
    }

    #[test]
    fn zero_threads_is_a_build_error() {
        let plan = test_plan([thread_group(
            0,
            1,
            [http_sampler("http://localhost/").into()],
        )
        .into()]);
        assert!(matches!(
            plan.validate(),
            Err(BuildError::NoThreads(name)) if name == "thread group 1"
        ));
    }

    #[test]
    fn zero_iterations_is_a_build_error() {
        let plan = test_plan([thread_group(
            1,
            0,
            [http_sampler("http://localhost/").into()],
        )
        .into()]);
        assert!(matches!(plan.validate(), Err(BuildError::NoIterations(_))));
    }

    #[test]
    fn invalid_url_is_a_build_error() {
        let plan = test_plan([thread_group(1, 1, [http_sampler("not a url").into()]).into()]);
        assert!(matches!(plan.validate(), Err(BuildError::InvalidUrl { .. })));
    }

    #[test]
    fn empty_plan_is_a_build_error() {
        let plan = test_plan(Vec::<PlanChild>::new());
        assert!(matches!(plan.validate(), Err(BuildError::EmptyPlan)));
    }
}
