//! Orchestration facade.
//!
//! [`QmioRuntime`] turns one `run` or `compile` call into the jobs it needs,
//! opening a tunnel for hardware backends, and returns parsed results or a
//! single [`RunCommandError`].

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use qmio_hal::{
    Action, BackendDescriptor, BackendRegistry, ExecutionMetrics, InputKind, ResultPayload,
};
use qmio_sched::{
    BatchScheduler, JobId, JobOutcome, JobState, JobSubmitter, SlurmAdapter, SlurmConfig,
    SubmittedJob,
};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::circuit::CircuitSource;
use crate::collector::ResultCollector;
use crate::config::{RuntimeConfig, TunnelMode};
use crate::error::{RunCommandError, RuntimeError, RuntimeResult, Stage};
use crate::script::{JobRequest, ScriptBuilder};
use crate::tunnel::{
    DirectTunnel, Endpoint, SchedulerTunnel, TunnelManager, TunnelProvider, TunnelSettings,
    verify_reachable,
};

/// How raw source reaches a run job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// One run job when the backend accepts source; compile first otherwise.
    #[default]
    Direct,
    /// Always compile first.
    PreCompile,
}

/// Parameters of [`QmioRuntime::run`].
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Circuit to execute.
    pub circuit: CircuitSource,
    /// Backend name; the configured default when unset.
    pub backend: Option<String>,
    /// Shots; the configured default when unset.
    pub shots: Option<u32>,
    /// How source reaches the run job.
    pub mode: RunMode,
    /// Results artifact path. Unset runs write a private file and publish it
    /// to the configured default on success.
    pub results: Option<PathBuf>,
    /// Execution metrics artifact path, defaulted like `results`.
    pub metrics: Option<PathBuf>,
    /// Instructions artifact path when compiling first, defaulted like `results`.
    pub instructions: Option<PathBuf>,
}

impl RunRequest {
    /// Run `circuit` with the configured defaults.
    pub fn new(circuit: impl Into<CircuitSource>) -> Self {
        Self {
            circuit: circuit.into(),
            backend: None,
            shots: None,
            mode: RunMode::default(),
            results: None,
            metrics: None,
            instructions: None,
        }
    }

    /// Target backend.
    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    /// Number of shots.
    pub fn shots(mut self, shots: u32) -> Self {
        self.shots = Some(shots);
        self
    }

    /// How source reaches the run job.
    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Results artifact path.
    pub fn results(mut self, path: impl Into<PathBuf>) -> Self {
        self.results = Some(path.into());
        self
    }

    /// Execution metrics artifact path.
    pub fn metrics(mut self, path: impl Into<PathBuf>) -> Self {
        self.metrics = Some(path.into());
        self
    }

    /// Instructions artifact path used when compiling first.
    pub fn instructions(mut self, path: impl Into<PathBuf>) -> Self {
        self.instructions = Some(path.into());
        self
    }
}

/// Parameters of [`QmioRuntime::compile`].
#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// Circuit to compile.
    pub circuit: CircuitSource,
    /// Backend name; the configured default when unset.
    pub backend: Option<String>,
    /// Shots baked into the instructions; the configured default when unset.
    pub shots: Option<u32>,
    /// Instructions artifact path; the configured default when unset.
    pub output: Option<PathBuf>,
}

impl CompileRequest {
    /// Compile `circuit` with the configured defaults.
    pub fn new(circuit: impl Into<CircuitSource>) -> Self {
        Self {
            circuit: circuit.into(),
            backend: None,
            shots: None,
            output: None,
        }
    }

    /// Target backend.
    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    /// Number of shots.
    pub fn shots(mut self, shots: u32) -> Self {
        self.shots = Some(shots);
        self
    }

    /// Instructions artifact path.
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }
}

/// Entry point for running and compiling circuits.
pub struct QmioRuntime {
    config: RuntimeConfig,
    registry: BackendRegistry,
    submitter: JobSubmitter,
    tunnels: TunnelManager,
    collector: ResultCollector,
}

impl QmioRuntime {
    /// Create a runtime submitting to SLURM with the built-in backends.
    pub async fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        let slurm = SlurmAdapter::new(SlurmConfig {
            script_dir: config.script_dir(),
            modules: config.scheduler.modules.clone(),
        })
        .await?;
        let registry = BackendRegistry::builtin(&config.backend_prefix);
        Self::with_scheduler(config, registry, Arc::new(slurm))
    }

    /// Create a runtime over an arbitrary scheduler and registry.
    pub fn with_scheduler(
        config: RuntimeConfig,
        registry: BackendRegistry,
        scheduler: Arc<dyn BatchScheduler>,
    ) -> RuntimeResult<Self> {
        config.validate()?;

        let submitter = JobSubmitter::new(scheduler).with_retry(config.retry_policy());
        let provider: Arc<dyn TunnelProvider> = match config.tunnel.mode {
            TunnelMode::Scheduler => Arc::new(SchedulerTunnel::new(
                submitter.clone(),
                tunnel_settings(&config)?,
            )),
            TunnelMode::Direct => Arc::new(DirectTunnel),
        };

        Ok(Self {
            config,
            registry,
            submitter,
            tunnels: TunnelManager::new(provider),
            collector: ResultCollector::new(),
        })
    }

    /// Validated configuration this runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Backends this runtime can target.
    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Tunnels shared by hardware runs.
    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    /// Execute a circuit and return its counts and execution metrics.
    pub async fn run(
        &self,
        request: RunRequest,
    ) -> Result<(ResultPayload, ExecutionMetrics), RunCommandError> {
        let build = |step, e: RuntimeError| RunCommandError::new(step, Stage::Build, e);

        let backend = request
            .backend
            .clone()
            .unwrap_or_else(|| self.config.default_backend.clone());
        let shots = request.shots.unwrap_or(self.config.default_shots);
        let desc = self.descriptor(&backend).map_err(|e| build(Action::Run, e))?;

        let compile_first = request.circuit.is_source()
            && (request.mode == RunMode::PreCompile || !desc.direct);
        if compile_first && !desc.supports(Action::Compile) {
            return Err(build(
                Action::Compile,
                RuntimeError::CompilationUnsupported(backend),
            ));
        }
        let endpoint = self.endpoint_for(desc).map_err(|e| build(Action::Run, e))?;

        let id = Uuid::new_v4();
        let paths = &self.config.paths;
        let results = self.artifact(request.results.as_deref(), &paths.results, &id);
        let metrics = self.artifact(request.metrics.as_deref(), &paths.metrics, &id);
        let instructions =
            self.artifact(request.instructions.as_deref(), &paths.instructions, &id);

        let step = if compile_first { Action::Compile } else { Action::Run };
        let input = request
            .circuit
            .materialize(&self.config.work_dir)
            .await
            .map_err(|e| build(step, e))?;

        let compile = compile_first
            .then(|| JobRequest::compile(&backend, &input, shots, &instructions.path));
        let (run_input, run_kind) = if compile_first {
            (instructions.path.clone(), InputKind::Instructions)
        } else {
            (input, request.circuit.kind())
        };
        let run = JobRequest::run(
            &backend,
            run_input,
            run_kind,
            shots,
            &results.path,
            &metrics.path,
        );

        // Validate both jobs before touching the scheduler. The tunnel address
        // is only known once the tunnel is up, so the remote stands in for it.
        let builder = self.builder();
        if let Some(ref compile) = compile {
            builder.build(compile).map_err(|e| build(Action::Compile, e))?;
        }
        let addressed = match endpoint {
            Some(ref ep) => run.clone().with_tunnel(ep.to_string()),
            None => run.clone(),
        };
        builder.build(&addressed).map_err(|e| build(Action::Run, e))?;

        info!(%backend, shots, compile_first, "Running circuit");

        let outcome = self.execute(compile, run, endpoint, shots).await;
        let artifacts = [&results, &metrics, &instructions];
        if outcome.is_ok() {
            publish(&artifacts).await;
        } else {
            discard(&artifacts).await;
        }
        outcome
    }

    /// Compile a circuit and return the path of the instructions artifact.
    pub async fn compile(&self, request: CompileRequest) -> Result<PathBuf, RunCommandError> {
        let build = |e: RuntimeError| RunCommandError::new(Action::Compile, Stage::Build, e);

        let backend = request
            .backend
            .clone()
            .unwrap_or_else(|| self.config.default_backend.clone());
        let shots = request.shots.unwrap_or(self.config.default_shots);
        let desc = self.descriptor(&backend).map_err(build)?;
        if !desc.supports(Action::Compile) {
            return Err(build(RuntimeError::CompilationUnsupported(backend)));
        }

        let output = self.artifact(
            request.output.as_deref(),
            &self.config.paths.instructions,
            &Uuid::new_v4(),
        );
        let input = request
            .circuit
            .materialize(&self.config.work_dir)
            .await
            .map_err(build)?;

        let mut compile = JobRequest::compile(&backend, input, shots, &output.path);
        compile.input_kind = request.circuit.kind();

        info!(%backend, shots, "Compiling circuit");
        let compiled = match self.submit_and_wait(&compile).await {
            Ok((job, outcome)) => self.collect_artifact(&job, &outcome).await,
            Err(e) => Err(e),
        };
        match compiled {
            Ok(path) => Ok(publish(&[&output]).await.into_iter().next().unwrap_or(path)),
            Err(e) => {
                discard(&[&output]).await;
                Err(e)
            }
        }
    }

    /// Current state of a job.
    pub async fn status(&self, id: &JobId) -> RuntimeResult<JobState> {
        Ok(self.submitter.poll(id).await?)
    }

    /// Request cancellation of a job.
    pub async fn cancel(&self, id: &JobId) -> RuntimeResult<()> {
        Ok(self.submitter.cancel(id).await?)
    }

    /// Close every tunnel this runtime opened.
    pub async fn shutdown(&self) {
        self.tunnels.close_all().await;
    }

    fn descriptor(&self, backend: &str) -> RuntimeResult<&BackendDescriptor> {
        self.registry
            .get(backend)
            .map_err(|_| RuntimeError::UnknownBackend(backend.to_string()))
    }

    fn endpoint_for(&self, desc: &BackendDescriptor) -> RuntimeResult<Option<Endpoint>> {
        if !desc.requires_tunnel {
            return Ok(None);
        }
        match self.config.endpoint()? {
            Some(endpoint) => Ok(Some(endpoint)),
            None => Err(RuntimeError::MissingEndpoint(desc.name.clone())),
        }
    }

    fn artifact(&self, requested: Option<&Path>, default: &Path, id: &Uuid) -> Artifact {
        match requested {
            Some(path) => Artifact {
                path: self.config.resolve(path),
                publish_to: None,
            },
            None => {
                let target = self.config.resolve(default);
                Artifact {
                    path: scratch_path(&target, id),
                    publish_to: Some(target),
                }
            }
        }
    }

    fn builder(&self) -> ScriptBuilder<'_> {
        ScriptBuilder::new(&self.registry)
            .with_log_dir(self.config.log_dir())
            .with_account(self.config.scheduler.account.clone())
            .with_reservation(self.config.tunnel.reservation.clone())
    }

    async fn submit_and_wait(
        &self,
        request: &JobRequest,
    ) -> Result<(SubmittedJob, JobOutcome), RunCommandError> {
        let step = request.action;
        let script = self
            .builder()
            .build(request)
            .map_err(|e| RunCommandError::new(step, Stage::Build, e))?;

        let job = self
            .submitter
            .submit(&script)
            .await
            .map_err(|e| RunCommandError::new(step, Stage::Submitted, e))?;

        let outcome = self
            .submitter
            .wait(&job, &self.config.wait_policy())
            .await
            .map_err(|e| RunCommandError::new(step, Stage::Waiting, e).with_job(&job.id))?;
        Ok((job, outcome))
    }

    /// Submit the jobs of a validated run, holding a tunnel lease around the
    /// run job when the backend needs one.
    async fn execute(
        &self,
        compile: Option<JobRequest>,
        run: JobRequest,
        endpoint: Option<Endpoint>,
        shots: u32,
    ) -> Result<(ResultPayload, ExecutionMetrics), RunCommandError> {
        if let Some(compile) = compile {
            let (job, outcome) = self.submit_and_wait(&compile).await?;
            let path = self.collect_artifact(&job, &outcome).await?;
            debug!(job_id = %job.id, path = %path.display(), "Compilation finished");
        }

        let Some(endpoint) = endpoint else {
            return self.run_job(&run, shots).await;
        };

        let opening =
            |e: RuntimeError| RunCommandError::new(Action::Run, Stage::TunnelOpening, e);
        let lease = self.tunnels.acquire(&endpoint).await.map_err(opening)?;
        if self.config.tunnel.verify_connection {
            let limit = Duration::from_secs(self.config.tunnel.connect_timeout_secs);
            if let Err(e) = verify_reachable(&lease.address, limit).await {
                lease.release().await;
                return Err(opening(e));
            }
        }

        let result = self
            .run_job(&run.with_tunnel(lease.address.clone()), shots)
            .await;
        lease.release().await;
        result
    }

    async fn collect_artifact(
        &self,
        job: &SubmittedJob,
        outcome: &JobOutcome,
    ) -> Result<PathBuf, RunCommandError> {
        self.collector
            .collect_artifact(job, outcome)
            .await
            .map_err(|e| collect_error(Action::Compile, job, outcome, e))
    }

    async fn run_job(
        &self,
        run: &JobRequest,
        shots: u32,
    ) -> Result<(ResultPayload, ExecutionMetrics), RunCommandError> {
        let (job, outcome) = self.submit_and_wait(run).await?;
        self.collector
            .collect(&job, &outcome, Some(shots))
            .await
            .map_err(|e| collect_error(Action::Run, &job, &outcome, e))
    }
}

/// Scheduler-reported failures surface while waiting; artifact problems while collecting.
fn collect_error(
    step: Action,
    job: &SubmittedJob,
    outcome: &JobOutcome,
    e: RuntimeError,
) -> RunCommandError {
    let stage = if outcome.state.is_success() {
        Stage::Collecting
    } else {
        Stage::Waiting
    };
    RunCommandError::new(step, stage, e).with_job(&job.id)
}

/// A job output path. Defaulted outputs go to a per-request file first and
/// are renamed onto `publish_to` once the request succeeds, so concurrent
/// requests never share an intermediate file.
struct Artifact {
    path: PathBuf,
    publish_to: Option<PathBuf>,
}

/// `dir/.stem-<id>.ext` next to `target`.
fn scratch_path(target: &Path, id: &Uuid) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default();
    let name = match target.extension() {
        Some(ext) => format!(".{stem}-{id}.{}", ext.to_string_lossy()),
        None => format!(".{stem}-{id}"),
    };
    target.with_file_name(name)
}

/// Move defaulted outputs to their published paths; returns the paths written.
async fn publish(artifacts: &[&Artifact]) -> Vec<PathBuf> {
    let mut published = Vec::new();
    for artifact in artifacts {
        let Some(ref target) = artifact.publish_to else {
            continue;
        };
        match fs::rename(&artifact.path, target).await {
            Ok(()) => published.push(target.clone()),
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => warn!(
                from = %artifact.path.display(),
                to = %target.display(),
                error = %e,
                "Could not publish artifact"
            ),
        }
    }
    published
}

/// Remove the per-request files of defaulted outputs.
async fn discard(artifacts: &[&Artifact]) {
    for artifact in artifacts.iter().filter(|a| a.publish_to.is_some()) {
        if let Err(e) = fs::remove_file(&artifact.path).await {
            if e.kind() != IoErrorKind::NotFound {
                debug!(path = %artifact.path.display(), error = %e, "Could not remove artifact");
            }
        }
    }
}

fn tunnel_settings(config: &RuntimeConfig) -> RuntimeResult<TunnelSettings> {
    let tunnel = &config.tunnel;
    Ok(TunnelSettings {
        forwarder: tunnel.forwarder.clone(),
        partition: tunnel.partition.clone(),
        time_limit: config.tunnel_time_limit()?,
        setup_overhead: Duration::from_secs(tunnel.setup_overhead_secs),
        start_timeout: Duration::from_secs(tunnel.start_timeout_secs),
        poll_interval: Duration::from_secs_f64(config.polling.interval_secs),
        ports: (tunnel.port_min, tunnel.port_max),
        account: config.scheduler.account.clone(),
        reservation: tunnel.reservation.clone(),
        log_dir: config.log_dir(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmio_hal::{QPU_FELISA, SIMULATOR_QULACS, SIMULATOR_RTCS};
    use qmio_sched::MockScheduler;

    fn runtime(dir: &Path, mock: Arc<MockScheduler>) -> QmioRuntime {
        let config = RuntimeConfig {
            work_dir: dir.to_path_buf(),
            ..Default::default()
        };
        let registry = BackendRegistry::builtin(Path::new("/opt/qmio"));
        QmioRuntime::with_scheduler(config, registry, mock).unwrap()
    }

    #[test]
    fn test_request_builders() {
        let request = RunRequest::new("bell.qasm")
            .backend(SIMULATOR_QULACS)
            .shots(64)
            .mode(RunMode::PreCompile)
            .results("out.json");
        assert_eq!(request.circuit, CircuitSource::SourceFile("bell.qasm".into()));
        assert_eq!(request.shots, Some(64));
        assert_eq!(request.mode, RunMode::PreCompile);
        assert_eq!(request.results, Some(PathBuf::from("out.json")));
        assert!(request.metrics.is_none());
    }

    #[test]
    fn test_scratch_path_is_unique_sibling() {
        let target = Path::new("/scratch/me/results.json");
        let a = scratch_path(target, &Uuid::new_v4());
        let b = scratch_path(target, &Uuid::new_v4());
        assert_ne!(a, b);
        assert_eq!(a.parent(), target.parent());
        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".results-") && name.ends_with(".json"));

        let bare = scratch_path(Path::new("out"), &Uuid::nil());
        assert_eq!(bare, PathBuf::from(format!(".out-{}", Uuid::nil())));
    }

    #[tokio::test]
    async fn test_precompile_without_compile_support() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockScheduler::new());
        let rt = runtime(dir.path(), mock.clone());

        let err = rt
            .run(
                RunRequest::new("OPENQASM 2.0;")
                    .backend(SIMULATOR_QULACS)
                    .mode(RunMode::PreCompile),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.source, RuntimeError::CompilationUnsupported(_)));
        assert_eq!(err.step, Action::Compile);
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_hardware_without_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockScheduler::new());
        let rt = runtime(dir.path(), mock.clone());

        let err = rt
            .run(RunRequest::new("OPENQASM 2.0;").backend(QPU_FELISA))
            .await
            .unwrap_err();
        assert!(matches!(err.source, RuntimeError::MissingEndpoint(_)));
        assert_eq!(err.stage, Stage::Build);
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_instructions_rejected_before_submission() {
        let dir = tempfile::tempdir().unwrap();
        let instructions = dir.path().join("circuit.p");
        std::fs::write(&instructions, b"\x80\x04").unwrap();
        let mock = Arc::new(MockScheduler::new());
        let rt = runtime(dir.path(), mock.clone());

        let err = rt
            .run(
                RunRequest::new(CircuitSource::Instructions(instructions))
                    .backend(SIMULATOR_QULACS),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.source, RuntimeError::UnsupportedInput { .. }));
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_reports_waiting_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockScheduler::new());
        mock.set_executor(|_| 1).await;
        let rt = runtime(dir.path(), mock.clone());

        let err = rt
            .run(RunRequest::new("OPENQASM 2.0;").backend(SIMULATOR_RTCS))
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Waiting);
        assert!(err.job_id.is_some());
        assert!(matches!(err.source, RuntimeError::JobFailed { .. }));
    }
}
