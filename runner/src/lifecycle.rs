//! Top-level orchestrator: bootstrap, run, shutdown.
//!
//! A [`Runner`] composes the capability provider, executor backend, retry
//! executor, watchdog-backed subprocesses, fallback handler and cache.
//! Per unit of work, [`Runner::run`]:
//!
//! 1. serves a fresh cache entry if there is one;
//! 2. loads and renders the capability prompt, enforcing the prompt budget;
//! 3. warms the binary up once per runner;
//! 4. runs attempts through the retry executor, bounded by the run deadline;
//! 5. parses and caches the output, or degrades the classified failure
//!    through the fallback handler.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::args::build_args;
use crate::core::classifier::classify;
use crate::core::lifecycle::LifecycleState;
use crate::core::output::{OutputParser, TextOutput};
use crate::core::types::{RunRequest, RunResult};
use crate::error::RunnerError;
use crate::fallback::{FallbackHandler, FallbackMetrics, FallbackRequest};
use crate::io::cache::{CacheEntry, ReviewCache};
use crate::io::capability::{CapabilityProvider, FileCapabilityProvider};
use crate::io::config::RunnerConfig;
use crate::io::executor::{CliExecutor, ExecRequest, Executor, executor_log_path};
use crate::io::process_manager::ProcessManager;
use crate::io::warmup::WarmupProbe;
use crate::parallel::{run_parallel, task};
use crate::retry::RetryExecutor;

#[derive(Debug)]
struct Status {
    state: LifecycleState,
    in_flight: usize,
}

impl Status {
    /// Move to `next` if the lifecycle table allows it, else report the
    /// current state.
    fn transition(&mut self, next: LifecycleState) -> Result<(), LifecycleState> {
        if !self.state.can_transition_to(next) {
            return Err(self.state);
        }
        debug!(from = %self.state, to = %next, "lifecycle transition");
        self.state = next;
        Ok(())
    }
}

pub struct Runner {
    config: RunnerConfig,
    status: Mutex<Status>,
    capabilities: Arc<dyn CapabilityProvider>,
    executor: Arc<dyn Executor>,
    parser: Arc<dyn OutputParser>,
    cache: Arc<ReviewCache>,
    fallback: FallbackHandler,
    processes: Arc<ProcessManager>,
    warmup: Option<WarmupProbe>,
    retry: RetryExecutor,
    shutdown: CancellationToken,
    runs: AtomicU64,
}

impl Runner {
    /// Runner wired to the real backends described by `config`.
    pub fn new(config: RunnerConfig) -> Self {
        let processes = Arc::new(ProcessManager::new());
        let cache = Arc::new(if config.cache.enabled {
            ReviewCache::new(
                config.cache.dir.clone(),
                Duration::from_secs(config.cache.ttl_secs),
            )
        } else {
            ReviewCache::disabled()
        });
        let warmup = config.warmup.enabled.then(|| {
            WarmupProbe::new(
                config.binary.clone(),
                config.warmup.args.clone(),
                Duration::from_secs(config.warmup.timeout_secs),
            )
        });
        Self {
            capabilities: Arc::new(FileCapabilityProvider::new(config.capabilities_dir.clone())),
            executor: Arc::new(CliExecutor::new(processes.clone())),
            parser: Arc::new(TextOutput),
            fallback: FallbackHandler::new(Some(cache.clone())),
            retry: RetryExecutor::new(config.retry_policy()),
            status: Mutex::new(Status {
                state: LifecycleState::Uninitialized,
                in_flight: 0,
            }),
            shutdown: CancellationToken::new(),
            runs: AtomicU64::new(0),
            config,
            cache,
            processes,
            warmup,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Arc<dyn CapabilityProvider>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn OutputParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ReviewCache>) -> Self {
        self.fallback = FallbackHandler::new(Some(cache.clone()));
        self.cache = cache;
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.status.lock().state
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ReviewCache> {
        &self.cache
    }

    pub fn processes(&self) -> &Arc<ProcessManager> {
        &self.processes
    }

    pub fn metrics(&self) -> FallbackMetrics {
        self.fallback.metrics()
    }

    /// Move `Uninitialized -> Initializing -> Ready`.
    ///
    /// Config validation, capability discovery and workspace validation run
    /// concurrently; the first failure is returned and the runner stays in
    /// `Initializing`.
    #[instrument(skip_all)]
    pub async fn bootstrap(&self) -> Result<(), RunnerError> {
        self.status
            .lock()
            .transition(LifecycleState::Initializing)
            .map_err(|_| RunnerError::AlreadyStarted)?;
        info!("bootstrapping runner");

        let config = async {
            self.config
                .validate()
                .map_err(|e| RunnerError::Config(format!("{e:#}")))
        };
        let capabilities = {
            let provider = self.capabilities.clone();
            async move {
                let names = tokio::task::spawn_blocking(move || provider.discover())
                    .await
                    .map_err(|e| RunnerError::TaskPanicked(e.to_string()))?
                    .map_err(|e| RunnerError::Capability(format!("{e:#}")))?;
                if names.is_empty() {
                    return Err(RunnerError::Capability("no capabilities found".to_string()));
                }
                Ok::<_, RunnerError>(names)
            }
        };
        let workspace = validate_workspace(&self.config.workspace_dir);
        let ((), names, ()) = tokio::try_join!(config, capabilities, workspace)?;

        // Refused when shutdown started while bootstrapping.
        self.status
            .lock()
            .transition(LifecycleState::Ready)
            .map_err(|_| RunnerError::ShuttingDown)?;
        info!(capabilities = ?names, "runner ready");
        Ok(())
    }

    /// Analyse one request.
    ///
    /// Degraded outcomes (skip, cache, partial) are returned as `Ok`; only
    /// failures the fallback handler refuses to absorb are `Err`.
    #[instrument(skip_all, fields(key = request.key, capability = %request.capability))]
    pub async fn run(
        &self,
        token: &CancellationToken,
        request: RunRequest,
    ) -> Result<RunResult, RunnerError> {
        let _in_flight = self.admit()?;
        let started = Instant::now();

        if let Some(entry) = self.cache.get_review(request.key) {
            info!("serving cached review");
            return Ok(RunResult {
                key: request.key,
                output: entry.payload,
                skipped: false,
                cached: true,
                partial: entry.partial,
                reason: entry
                    .partial
                    .then(|| "cached partial result".to_string()),
                attempts: 0,
                duration_ms: elapsed_ms(started),
            });
        }

        let run_id = self.runs.fetch_add(1, Ordering::Relaxed) + 1;
        let run_token = self.shutdown.child_token();
        let _cancel_on_exit = run_token.clone().drop_guard();
        link(token, &run_token);

        let attempts = AtomicU32::new(0);
        let outcome = self
            .with_deadline(&run_token, self.execute(&run_token, &request, run_id, &attempts))
            .await;
        let attempts = attempts.load(Ordering::SeqCst);
        let duration_ms = elapsed_ms(started);

        match outcome {
            Ok(output) => {
                let entry = CacheEntry::new(request.key, output.clone(), started.elapsed());
                self.store(request.key, entry);
                info!(attempts, duration_ms, "review completed");
                Ok(RunResult::completed(request.key, output, attempts, duration_ms))
            }
            Err(err) => {
                let classified = classify(&err);
                let partial_output = err.partial_output();
                let fallback = self.fallback.handle(
                    &classified,
                    &FallbackRequest {
                        key: request.key,
                        partial_output,
                    },
                );
                let Some(fallback) = fallback else {
                    warn!(err = %err, code = %classified.code(), "review failed");
                    return Err(err);
                };
                if fallback.partial && !fallback.cached && partial_output.is_some() {
                    let mut entry =
                        CacheEntry::new(request.key, fallback.output.clone(), started.elapsed());
                    entry.partial = true;
                    self.store(request.key, entry);
                }
                Ok(RunResult {
                    key: request.key,
                    output: fallback.output,
                    skipped: fallback.skipped,
                    cached: fallback.cached,
                    partial: fallback.partial,
                    reason: Some(fallback.reason),
                    attempts,
                    duration_ms,
                })
            }
        }
    }

    /// Run every request concurrently; the first unabsorbed failure cancels
    /// the rest. Results come back in request order.
    pub async fn run_all(
        self: &Arc<Self>,
        token: &CancellationToken,
        requests: Vec<RunRequest>,
    ) -> Result<Vec<RunResult>, RunnerError> {
        let results = Arc::new(Mutex::new(vec![None; requests.len()]));
        let tasks = requests
            .into_iter()
            .enumerate()
            .map(|(index, request)| {
                let runner = self.clone();
                let results = results.clone();
                task(move |token| async move {
                    let result = runner.run(&token, request).await?;
                    results.lock()[index] = Some(result);
                    Ok(())
                })
            })
            .collect();
        run_parallel(token, tasks).await?;

        let results = std::mem::take(&mut *results.lock());
        results
            .into_iter()
            .map(|result| {
                result.ok_or_else(|| RunnerError::TaskPanicked("task finished without a result".into()))
            })
            .collect()
    }

    /// Drain subprocesses and stop. Idempotent.
    ///
    /// Tracked subprocesses get a graceful stop, `shutdown_grace` to exit,
    /// then a kill; in-flight runs are cancelled afterwards.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) -> Result<(), RunnerError> {
        {
            let mut status = self.status.lock();
            if matches!(
                status.state,
                LifecycleState::Stopped | LifecycleState::ShuttingDown
            ) {
                return Ok(());
            }
            status
                .transition(LifecycleState::ShuttingDown)
                .map_err(|state| RunnerError::NotInitialized { state })?;
        }
        info!("shutting down runner");

        let stuck = self.processes.shutdown(self.config.shutdown_grace()).await;
        if !stuck.is_empty() {
            warn!(ids = ?stuck, "force-killed subprocesses after grace period");
        }
        self.shutdown.cancel();

        self.status
            .lock()
            .transition(LifecycleState::Stopped)
            .map_err(|state| RunnerError::NotInitialized { state })?;
        info!("runner stopped");
        Ok(())
    }

    /// Drive `job` to completion, shutting down gracefully if `signal` fires
    /// first. The job still runs to its (now cancelled) end.
    pub async fn run_until_signal<F: Future>(&self, signal: &CancellationToken, job: F) -> F::Output {
        tokio::pin!(job);
        tokio::select! {
            biased;
            output = &mut job => return output,
            _ = signal.cancelled() => {}
        }
        warn!("termination requested; draining runner");
        if let Err(err) = self.shutdown().await {
            warn!(err = %err, "shutdown");
        }
        job.await
    }

    fn admit(&self) -> Result<InFlight<'_>, RunnerError> {
        let mut status = self.status.lock();
        if !status.state.accepts_work() {
            return Err(RunnerError::NotInitialized {
                state: status.state,
            });
        }
        if status.state == LifecycleState::Ready {
            status
                .transition(LifecycleState::Running)
                .map_err(|state| RunnerError::NotInitialized { state })?;
        }
        status.in_flight += 1;
        Ok(InFlight { runner: self })
    }

    async fn execute(
        &self,
        token: &CancellationToken,
        request: &RunRequest,
        run_id: u64,
        attempts: &AtomicU32,
    ) -> Result<String, RunnerError> {
        let capability = self
            .capabilities
            .load(&request.capability)
            .map_err(|e| RunnerError::Capability(format!("{e:#}")))?;
        let prompt = capability
            .render_prompt(request)
            .map_err(|e| RunnerError::Capability(format!("{e:#}")))?;
        if prompt.len() > self.config.max_prompt_bytes {
            return Err(RunnerError::ResourceLimit(format!(
                "prompt is too large ({} bytes, budget {})",
                prompt.len(),
                self.config.max_prompt_bytes
            )));
        }

        if let Some(warmup) = &self.warmup {
            let report = warmup.ensure_warm().await?;
            debug!(version = %report.version, "binary warm");
        }

        let args = build_args(&self.config.base_args, &capability.options);
        let timeout = capability
            .options
            .timeout_secs
            .map_or_else(|| self.config.attempt_timeout(), Duration::from_secs);
        let executor = &self.executor;
        let parser = &self.parser;
        self.retry
            .execute(token, |attempt| {
                attempts.store(attempt, Ordering::SeqCst);
                let exec_request = ExecRequest {
                    id: format!("review-{}-run-{run_id}-attempt-{attempt}", request.key),
                    key: request.key,
                    attempt,
                    program: self.config.binary.clone(),
                    args: args.clone(),
                    workdir: Some(self.config.workspace_dir.clone()),
                    prompt: prompt.clone(),
                    timeout,
                    kill_grace: self.config.kill_grace(),
                    output_limit_bytes: self.config.output_limit_bytes,
                    log_path: self
                        .config
                        .executor_log_dir
                        .as_deref()
                        .map(|dir| executor_log_path(dir, request.key, attempt)),
                };
                async move {
                    let output = executor.exec(&exec_request, token).await?;
                    parser.parse(&output.stdout)
                }
            })
            .await
    }

    /// Await `work`, cancelling `token` if the whole-run deadline passes first.
    async fn with_deadline<T>(
        &self,
        token: &CancellationToken,
        work: impl Future<Output = Result<T, RunnerError>>,
    ) -> Result<T, RunnerError> {
        let deadline = self.config.run_timeout();
        tokio::pin!(work);
        tokio::select! {
            biased;
            result = &mut work => return result,
            _ = tokio::time::sleep(deadline) => {}
        }
        warn!(deadline_secs = deadline.as_secs(), "run deadline exceeded; cancelling");
        token.cancel();
        // Let the attempt tear its subprocess down before reporting.
        let _ = work.await;
        Err(RunnerError::Timeout {
            after: Some(deadline),
        })
    }

    fn store(&self, key: u64, entry: CacheEntry) {
        if let Err(err) = self.cache.set_review(key, entry) {
            warn!(key, err = ?err, "cache review");
        }
    }
}

/// Decrements the in-flight count; the last run out returns the runner to `Ready`.
struct InFlight<'a> {
    runner: &'a Runner,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut status = self.runner.status.lock();
        status.in_flight = status.in_flight.saturating_sub(1);
        if status.in_flight == 0 {
            // Refused once shutdown has begun.
            let _ = status.transition(LifecycleState::Ready);
        }
    }
}

/// Cancel `child` when `parent` is cancelled. The link ends with `child`.
fn link(parent: &CancellationToken, child: &CancellationToken) {
    let parent = parent.clone();
    let child = child.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = parent.cancelled() => child.cancel(),
            _ = child.cancelled() => {}
        }
    });
}

async fn validate_workspace(dir: &Path) -> Result<(), RunnerError> {
    let path = dir.to_path_buf();
    let metadata = tokio::task::spawn_blocking(move || std::fs::metadata(path))
        .await
        .map_err(|e| RunnerError::TaskPanicked(e.to_string()))?
        .map_err(|e| RunnerError::Workspace(format!("workspace {}: {e}", dir.display())))?;
    if !metadata.is_dir() {
        return Err(RunnerError::Workspace(format!(
            "workspace {} is not a directory",
            dir.display()
        )));
    }
    Ok(())
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::FallbackAction;
    use crate::test_support::{Scripted, ScriptedExecutor, StaticCapabilities, test_config};

    struct Fixture {
        _temp: tempfile::TempDir,
        runner: Runner,
        executor: Arc<ScriptedExecutor>,
    }

    fn fixture(script: Vec<Scripted>) -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = Arc::new(ScriptedExecutor::new(script));
        let runner = Runner::new(test_config(temp.path()))
            .with_capabilities(Arc::new(StaticCapabilities::review()))
            .with_executor(executor.clone());
        Fixture {
            _temp: temp,
            runner,
            executor,
        }
    }

    fn request(key: u64) -> RunRequest {
        RunRequest::new(key, "review", "+ let x = 1;")
    }

    fn rate_limited() -> Scripted {
        Scripted::Fail {
            exit_code: 1,
            stderr: "rate limit exceeded (429)".to_string(),
            stdout: String::new(),
        }
    }

    #[tokio::test]
    async fn bootstrap_reaches_ready_once() {
        let f = fixture(vec![]);
        f.runner.bootstrap().await.expect("bootstrap");
        assert_eq!(f.runner.state(), LifecycleState::Ready);

        let err = f.runner.bootstrap().await.unwrap_err();
        assert!(matches!(err, RunnerError::AlreadyStarted), "{err}");
        assert_eq!(f.runner.state(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn failed_bootstrap_stays_initializing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(temp.path());
        config.workspace_dir = temp.path().join("missing");
        let runner =
            Runner::new(config).with_capabilities(Arc::new(StaticCapabilities::review()));

        let err = runner.bootstrap().await.unwrap_err();
        assert!(matches!(err, RunnerError::Workspace(_)), "{err}");
        assert_eq!(runner.state(), LifecycleState::Initializing);
    }

    #[tokio::test]
    async fn workspace_must_be_a_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = temp.path().join("not-a-dir");
        std::fs::write(&file, "x").expect("write");
        let mut config = test_config(temp.path());
        config.workspace_dir = file;
        let runner =
            Runner::new(config).with_capabilities(Arc::new(StaticCapabilities::review()));

        let err = runner.bootstrap().await.unwrap_err();
        assert!(matches!(err, RunnerError::Workspace(_)), "{err}");
        assert!(err.to_string().contains("not a directory"), "{err}");
    }

    #[test]
    fn status_follows_lifecycle_table() {
        let mut status = Status {
            state: LifecycleState::Uninitialized,
            in_flight: 0,
        };
        assert_eq!(
            status.transition(LifecycleState::Ready),
            Err(LifecycleState::Uninitialized)
        );
        status.transition(LifecycleState::Initializing).expect("initializing");
        status.transition(LifecycleState::Ready).expect("ready");
        status.transition(LifecycleState::ShuttingDown).expect("shutting down");
        assert_eq!(
            status.transition(LifecycleState::Ready),
            Err(LifecycleState::ShuttingDown)
        );
        status.transition(LifecycleState::Stopped).expect("stopped");
        assert_eq!(
            status.transition(LifecycleState::Initializing),
            Err(LifecycleState::Stopped)
        );
        assert_eq!(status.state, LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn bootstrap_after_shutdown_is_refused() {
        let f = fixture(vec![]);
        f.runner.shutdown().await.expect("shutdown");
        assert_eq!(f.runner.state(), LifecycleState::Stopped);

        let err = f.runner.bootstrap().await.unwrap_err();
        assert!(matches!(err, RunnerError::AlreadyStarted), "{err}");
        assert_eq!(f.runner.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn unknown_capability_propagates_instead_of_skipping() {
        let f = fixture(vec![Scripted::Stdout("unused".into())]);
        f.runner.bootstrap().await.expect("bootstrap");

        let err = f
            .runner
            .run(
                &CancellationToken::new(),
                RunRequest::new(1, "authentication-audit", "x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Capability(_)), "{err}");
        assert_eq!(f.executor.call_count(), 0);

        let metrics = f.runner.metrics();
        assert_eq!(metrics.code_count("INFRASTRUCTURE"), 1);
        assert_eq!(metrics.code_count("UNAUTHORIZED"), 0);
        assert_eq!(metrics.action_count(FallbackAction::Fail), 1);
        assert_eq!(metrics.action_count(FallbackAction::Skip), 0);
    }

    #[tokio::test]
    async fn every_run_gets_its_own_process_ids() {
        let f = fixture(vec![Scripted::Stdout("ok".into())]);
        let runner = f.runner.with_cache(Arc::new(ReviewCache::disabled()));
        runner.bootstrap().await.expect("bootstrap");

        for _ in 0..2 {
            runner
                .run(&CancellationToken::new(), request(1))
                .await
                .expect("run");
        }
        let ids: Vec<String> = f.executor.calls().into_iter().map(|call| call.id).collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert!(ids.iter().all(|id| id.starts_with("review-1-run-")), "{ids:?}");
    }

    #[tokio::test]
    async fn run_before_bootstrap_is_rejected() {
        let f = fixture(vec![Scripted::Stdout("ok".into())]);
        let err = f
            .runner
            .run(&CancellationToken::new(), request(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::NotInitialized { .. }), "{err}");
        assert_eq!(f.executor.call_count(), 0);
    }

    #[tokio::test]
    async fn success_is_cached_and_served_again() {
        let f = fixture(vec![Scripted::Stdout("  Looks good.\n".into())]);
        f.runner.bootstrap().await.expect("bootstrap");

        let first = f
            .runner
            .run(&CancellationToken::new(), request(42))
            .await
            .expect("run");
        assert_eq!(first.output, "Looks good.");
        assert_eq!(first.attempts, 1);
        assert!(!first.cached);
        assert_eq!(f.runner.state(), LifecycleState::Ready);

        let second = f
            .runner
            .run(&CancellationToken::new(), request(42))
            .await
            .expect("cached run");
        assert!(second.cached);
        assert_eq!(second.output, "Looks good.");
        assert_eq!(f.executor.call_count(), 1);
    }

    #[tokio::test]
    async fn rate_limit_exhausts_retries_and_propagates() {
        let f = fixture(vec![rate_limited()]);
        f.runner.bootstrap().await.expect("bootstrap");

        let err = f
            .runner
            .run(&CancellationToken::new(), request(7))
            .await
            .unwrap_err();
        assert!(
            matches!(err, RunnerError::MaxRetriesExceeded { attempts: 4, .. }),
            "{err}"
        );
        assert_eq!(f.executor.call_count(), 4);

        let metrics = f.runner.metrics();
        assert_eq!(metrics.total, 1);
        assert_eq!(metrics.code_count("RATE_LIMITED"), 1);
        assert_eq!(metrics.action_count(FallbackAction::Retry), 1);
        assert_eq!(metrics.action_count(FallbackAction::Skip), 0);
        assert_eq!(f.runner.state(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn unauthorized_is_skipped_without_retry() {
        let f = fixture(vec![Scripted::Fail {
            exit_code: 1,
            stderr: "API error: 401 Unauthorized".to_string(),
            stdout: String::new(),
        }]);
        f.runner.bootstrap().await.expect("bootstrap");

        let result = f
            .runner
            .run(&CancellationToken::new(), request(8))
            .await
            .expect("degraded result");
        assert!(result.skipped);
        assert!(result.output.contains("did not block the CI run"));
        assert_eq!(result.attempts, 1);
        assert!(f.runner.cache().get_review(8).is_none());
    }

    #[tokio::test]
    async fn context_overflow_returns_partial_output() {
        let f = fixture(vec![Scripted::Fail {
            exit_code: 1,
            stderr: "Error: context length exceeded".to_string(),
            stdout: "1. unchecked unwrap in parser\n".to_string(),
        }]);
        f.runner.bootstrap().await.expect("bootstrap");

        let result = f
            .runner
            .run(&CancellationToken::new(), request(9))
            .await
            .expect("partial result");
        assert!(result.partial);
        assert!(!result.skipped);
        assert_eq!(result.output, "1. unchecked unwrap in parser");
        assert!(f.runner.cache().get_review(9).expect("cached").partial);
    }

    #[tokio::test]
    async fn oversized_prompt_never_reaches_executor() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(temp.path());
        config.max_prompt_bytes = 16;
        let executor = Arc::new(ScriptedExecutor::new(vec![Scripted::Stdout("x".into())]));
        let runner = Runner::new(config)
            .with_capabilities(Arc::new(StaticCapabilities::review()))
            .with_executor(executor.clone());
        runner.bootstrap().await.expect("bootstrap");

        let result = runner
            .run(&CancellationToken::new(), request(10))
            .await
            .expect("partial result");
        assert!(result.partial);
        assert!(result.reason.as_deref().unwrap_or("").contains("too large"));
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn run_deadline_yields_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(temp.path());
        config.run_timeout_secs = 1;
        let runner = Runner::new(config)
            .with_capabilities(Arc::new(StaticCapabilities::review()))
            .with_executor(Arc::new(ScriptedExecutor::new(vec![Scripted::Hang])));
        runner.bootstrap().await.expect("bootstrap");

        let err = runner
            .run(&CancellationToken::new(), request(11))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { .. }), "{err}");
    }

    #[tokio::test]
    async fn run_all_preserves_request_order() {
        let f = fixture(vec![
            Scripted::Stdout("first".into()),
            Scripted::Stdout("second".into()),
        ]);
        f.runner.bootstrap().await.expect("bootstrap");
        let runner = Arc::new(f.runner);

        let results = runner
            .run_all(&CancellationToken::new(), vec![request(1), request(2)])
            .await
            .expect("run all");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].key, 1);
        assert_eq!(results[1].key, 2);
        assert_eq!(runner.state(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_blocks_new_runs() {
        let f = fixture(vec![Scripted::Stdout("ok".into())]);
        f.runner.bootstrap().await.expect("bootstrap");
        f.runner.shutdown().await.expect("shutdown");
        assert_eq!(f.runner.state(), LifecycleState::Stopped);
        f.runner.shutdown().await.expect("second shutdown");
        assert_eq!(f.runner.state(), LifecycleState::Stopped);

        let err = f
            .runner
            .run(&CancellationToken::new(), request(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::NotInitialized { .. }), "{err}");
    }

    #[tokio::test]
    async fn signal_during_run_shuts_down() {
        let f = fixture(vec![Scripted::Hang]);
        f.runner.bootstrap().await.expect("bootstrap");
        let signal = CancellationToken::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let token = CancellationToken::new();
        let result = f
            .runner
            .run_until_signal(&signal, f.runner.run(&token, request(3)))
            .await;
        assert!(result.is_err());
        assert_eq!(f.runner.state(), LifecycleState::Stopped);
    }
}
