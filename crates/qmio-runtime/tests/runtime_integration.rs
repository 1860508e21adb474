//! End-to-end tests of [`QmioRuntime`] against the in-process scheduler.
//!
//! The mock executor plays the backend executables: it reads the job's
//! arguments and writes the artifacts a real `compile.sh` or `run.sh` would.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use qmio_hal::{Action, BackendRegistry, QPU_FELISA, SIMULATOR_QULACS, SIMULATOR_RTCS};
use qmio_runtime::{
    CompileRequest, ENDPOINT_ENV, ErrorKind, QmioRuntime, RunMode, RunRequest, RuntimeConfig,
    RuntimeError, Stage, TunnelMode,
};
use qmio_sched::{JobScript, JobState, Lifecycle, MockScheduler};
use tokio::time::{sleep, timeout};

const BELL: &str = "OPENQASM 2.0;\ninclude \"qelib1.inc\";\nqreg q[2];\ncreg c[2];\nh q[0];\ncx q[0],q[1];\nmeasure q -> c;\n";

const FLIPPED: &str = "OPENQASM 2.0;\ninclude \"qelib1.inc\";\nqreg q[2];\ncreg c[2];\nx q[0];\nx q[1];\nmeasure q -> c;\n";

/// Plays `compile.sh input output shots` and `run.sh input results metrics shots`.
///
/// Compiling copies the circuit through unchanged. Running a circuit with a
/// line starting `x q[` puts every shot in `11`; anything else splits `00`/`11`.
fn fake_backend(script: &JobScript) -> i32 {
    let args = &script.command.args;
    if script.name.starts_with("qmio-compile") {
        return match std::fs::copy(&args[0], &args[1]) {
            Ok(_) => 0,
            Err(_) => 1,
        };
    }
    if script.name.starts_with("qmio-run") {
        let Ok(shots) = args[3].parse::<u64>() else {
            return 2;
        };
        let circuit = std::fs::read(&args[0]).unwrap_or_default();
        let half = if String::from_utf8_lossy(&circuit).contains("\nx q[") {
            0
        } else {
            shots / 2
        };
        let results = format!(r#"{{"counts": {{"00": {half}, "11": {}}}}}"#, shots - half);
        let metrics = r#"{"execution_time": 0.5}"#;
        if std::fs::write(&args[1], results).is_err() || std::fs::write(&args[2], metrics).is_err()
        {
            return 1;
        }
    }
    0
}

fn config(dir: &Path) -> RuntimeConfig {
    RuntimeConfig {
        work_dir: dir.to_path_buf(),
        ..Default::default()
    }
}

fn runtime(config: RuntimeConfig, mock: &Arc<MockScheduler>) -> QmioRuntime {
    let registry = BackendRegistry::builtin(Path::new("/mnt/Q_SWAP/qmio/backends"));
    QmioRuntime::with_scheduler(config, registry, mock.clone()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_bell_on_simulator_rtcs() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockScheduler::new());
    mock.set_executor(fake_backend).await;
    let rt = runtime(config(dir.path()), &mock);

    let (results, metrics) = rt
        .run(RunRequest::new(BELL).backend(SIMULATOR_RTCS).shots(1000))
        .await
        .unwrap();

    assert_eq!(results.total_shots(), 1000);
    assert_eq!(results.counts.len(), 2);
    assert_eq!(results.counts.get("00") + results.counts.get("11"), 1000);
    assert_eq!(metrics.execution_secs, 0.5);

    // The rtcs simulator only runs instructions, so source compiles first.
    assert_eq!(mock.submit_count(), 2);
    let scripts = mock.submitted_scripts().await;
    assert_eq!(scripts[0].name, "qmio-compile-simulator_rtcs");
    assert_eq!(scripts[1].name, "qmio-run-simulator_rtcs");
    assert_eq!(scripts[1].command.args[0], scripts[0].command.args[1]);
    for script in &scripts {
        assert_eq!(script.resources.partition, "ilk");
        assert!(script.env_var(ENDPOINT_ENV).is_none());
    }

    assert!(dir.path().join("results.json").is_file());
    assert!(dir.path().join("execution_metrics.json").is_file());
    assert!(dir.path().join("instructions.p").is_file());
}

#[tokio::test(start_paused = true)]
async fn test_qulacs_runs_source_directly() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockScheduler::new());
    mock.set_executor(fake_backend).await;
    let rt = runtime(config(dir.path()), &mock);

    let (results, _) = rt
        .run(RunRequest::new(BELL).backend(SIMULATOR_QULACS).shots(10))
        .await
        .unwrap();
    assert_eq!(results.total_shots(), 10);
    assert_eq!(mock.submit_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_precompile_runs_two_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockScheduler::new());
    mock.set_executor(fake_backend).await;
    let rt = runtime(config(dir.path()), &mock);

    let (results, _) = rt
        .run(
            RunRequest::new(BELL)
                .backend(SIMULATOR_RTCS)
                .shots(300)
                .mode(RunMode::PreCompile),
        )
        .await
        .unwrap();
    assert_eq!(results.total_shots(), 300);

    let scripts = mock.submitted_scripts().await;
    assert_eq!(scripts.len(), 2);
    assert_eq!(scripts[0].name, "qmio-compile-simulator_rtcs");
    assert_eq!(scripts[1].name, "qmio-run-simulator_rtcs");

    // The compile output is private to the request and lands on the default
    // path only after the run succeeds.
    let intermediate = &scripts[0].command.args[1];
    assert_eq!(&scripts[1].command.args[0], intermediate);
    assert!(intermediate.contains(".instructions-"));
    assert!(!Path::new(intermediate).exists());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("instructions.p")).unwrap(),
        BELL
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_precompile_runs_keep_their_own_instructions() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockScheduler::new());
    mock.set_executor(fake_backend).await;
    let rt = runtime(config(dir.path()), &mock);

    let request = |circuit: &str| {
        RunRequest::new(circuit)
            .backend(SIMULATOR_RTCS)
            .shots(100)
            .mode(RunMode::PreCompile)
    };
    let (bell, flipped) = futures::join!(rt.run(request(BELL)), rt.run(request(FLIPPED)));
    let (bell, _) = bell.unwrap();
    let (flipped, _) = flipped.unwrap();

    assert_eq!(bell.counts.get("00"), 50);
    assert_eq!(bell.counts.get("11"), 50);
    assert_eq!(flipped.counts.get("00"), 0);
    assert_eq!(flipped.counts.get("11"), 100);

    let scripts = mock.submitted_scripts().await;
    let outputs: Vec<_> = scripts
        .iter()
        .filter(|s| s.name.starts_with("qmio-compile"))
        .map(|s| s.command.args[1].clone())
        .collect();
    assert_eq!(outputs.len(), 2);
    assert_ne!(outputs[0], outputs[1]);

    // Both published onto the defaults; no per-request files left behind.
    assert!(dir.path().join("results.json").is_file());
    assert!(dir.path().join("instructions.p").is_file());
    let leftovers = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.starts_with(".results-") || name.starts_with(".instructions-")
        })
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_compile_skips_run() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockScheduler::new());
    mock.set_executor(|script: &JobScript| {
        if script.name.starts_with("qmio-compile") { 1 } else { 0 }
    })
    .await;
    let rt = runtime(config(dir.path()), &mock);

    let err = rt
        .run(RunRequest::new(BELL).mode(RunMode::PreCompile))
        .await
        .unwrap_err();
    assert_eq!(err.step, Action::Compile);
    assert_eq!(err.kind(), ErrorKind::JobFailed);
    assert_eq!(mock.submit_count(), 1);
}

#[tokio::test]
async fn test_unknown_backend_makes_no_scheduler_calls() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockScheduler::new());
    let rt = runtime(config(dir.path()), &mock);

    let err = rt
        .run(RunRequest::new(BELL).backend("simulator_nope"))
        .await
        .unwrap_err();
    assert!(matches!(err.source, RuntimeError::UnknownBackend(ref b) if b == "simulator_nope"));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(mock.calls(), 0);
}

#[tokio::test]
async fn test_compile_on_hardware_is_rejected_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockScheduler::new());
    let rt = runtime(config(dir.path()), &mock);

    let err = rt
        .compile(CompileRequest::new(BELL).backend(QPU_FELISA))
        .await
        .unwrap_err();
    assert!(matches!(err.source, RuntimeError::CompilationUnsupported(_)));
    assert_eq!(err.stage, Stage::Build);
    assert_eq!(mock.calls(), 0);

    let err = rt
        .compile(CompileRequest::new(BELL).backend(SIMULATOR_QULACS))
        .await
        .unwrap_err();
    assert!(matches!(err.source, RuntimeError::CompilationUnsupported(_)));
    assert_eq!(mock.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_compile_returns_instructions_path() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockScheduler::new());
    mock.set_executor(fake_backend).await;
    let rt = runtime(config(dir.path()), &mock);

    let path = rt
        .compile(
            CompileRequest::new(BELL)
                .backend(SIMULATOR_RTCS)
                .output("bell.p"),
        )
        .await
        .unwrap();
    assert_eq!(path, dir.path().join("bell.p"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), BELL);

    let path = rt
        .compile(CompileRequest::new(BELL).backend(SIMULATOR_RTCS))
        .await
        .unwrap();
    assert_eq!(path, dir.path().join("instructions.p"));
}

#[tokio::test(start_paused = true)]
async fn test_success_without_artifact_is_result_file_missing() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockScheduler::new());
    mock.set_executor(|_: &JobScript| 0).await;
    let rt = runtime(config(dir.path()), &mock);

    let err = rt
        .run(RunRequest::new(BELL).backend(SIMULATOR_RTCS))
        .await
        .unwrap_err();
    assert!(matches!(err.source, RuntimeError::ResultFileMissing { .. }));
    assert_eq!(err.step, Action::Compile);
    assert_eq!(err.stage, Stage::Collecting);
    assert_eq!(err.kind(), ErrorKind::JobFailed);
}

#[tokio::test(start_paused = true)]
async fn test_wait_timeout_leaves_job_alone() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockScheduler::new());
    mock.set_default_lifecycle(Lifecycle::completes_after(1, 40)).await;
    let mut config = config(dir.path());
    config.polling.interval_secs = 1.0;
    config.polling.max_interval_secs = 1.0;
    config.polling.wait_timeout_secs = 5;
    let rt = runtime(config, &mock);

    let err = rt
        .run(RunRequest::new(BELL).backend(SIMULATOR_RTCS))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WaitTimeout);
    assert_eq!(err.stage, Stage::Waiting);
    let job_id = err.job_id.clone().unwrap();
    assert_eq!(mock.cancel_count(), 0);

    let mut state = rt.status(&job_id).await.unwrap();
    for _ in 0..60 {
        if state.is_terminal() {
            break;
        }
        state = rt.status(&job_id).await.unwrap();
    }
    assert_eq!(state, JobState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockScheduler::new());
    mock.set_default_lifecycle(Lifecycle::runs_forever(0)).await;
    let mut config = config(dir.path());
    config.polling.wait_timeout_secs = 3;
    let rt = runtime(config, &mock);

    let err = rt
        .run(RunRequest::new(BELL).backend(SIMULATOR_RTCS))
        .await
        .unwrap_err();
    let job_id = err.job_id.unwrap();

    rt.cancel(&job_id).await.unwrap();
    assert_eq!(rt.status(&job_id).await.unwrap(), JobState::Cancelled);
    // Cancelling a finished job is not an error.
    rt.cancel(&job_id).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_hardware_runs_share_one_tunnel() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockScheduler::new().with_node("c7-3"));
    mock.set_executor(fake_backend).await;
    mock.set_lifecycle_for("qmio-tunnel", Lifecycle::runs_forever(1))
        .await;
    let mut config = config(dir.path());
    config.tunnel.endpoint = Some("tcp://10.5.7.1:5556".into());
    let rt = runtime(config, &mock);

    let a = rt.run(
        RunRequest::new(BELL)
            .backend(QPU_FELISA)
            .shots(100)
            .results(dir.path().join("a.json"))
            .metrics(dir.path().join("a-metrics.json")),
    );
    let b = rt.run(
        RunRequest::new(BELL)
            .backend(QPU_FELISA)
            .shots(200)
            .results(dir.path().join("b.json"))
            .metrics(dir.path().join("b-metrics.json")),
    );
    let (a, b) = futures::join!(a, b);
    assert_eq!(a.unwrap().0.total_shots(), 100);
    assert_eq!(b.unwrap().0.total_shots(), 200);

    let scripts = mock.submitted_scripts().await;
    let tunnels: Vec<_> = scripts
        .iter()
        .filter(|s| s.name.starts_with("qmio-tunnel"))
        .collect();
    assert_eq!(tunnels.len(), 1);
    let port = &tunnels[0].command.args[0];
    let expected = format!("tcp://c7-3:{port}");

    let runs: Vec<_> = scripts
        .iter()
        .filter(|s| s.name == "qmio-run-qpu_felisa")
        .collect();
    assert_eq!(runs.len(), 2);
    for run in runs {
        assert_eq!(run.env_var(ENDPOINT_ENV), Some(expected.as_str()));
        assert_eq!(run.resources.partition, "qpu");
    }

    assert_eq!(rt.tunnels().open_count(), 0);
    assert_eq!(mock.cancel_count(), 1);
}

fn hardware_config(dir: &Path) -> RuntimeConfig {
    let mut config = config(dir);
    config.tunnel.endpoint = Some("tcp://10.5.7.1:5556".into());
    config
}

#[tokio::test(start_paused = true)]
async fn test_failed_hardware_run_releases_tunnel() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockScheduler::new().with_node("c7-3"));
    mock.set_executor(|script: &JobScript| {
        if script.name.starts_with("qmio-run") { 1 } else { 0 }
    })
    .await;
    mock.set_lifecycle_for("qmio-tunnel", Lifecycle::runs_forever(0))
        .await;
    let rt = runtime(hardware_config(dir.path()), &mock);

    let err = rt
        .run(RunRequest::new(BELL).backend(QPU_FELISA))
        .await
        .unwrap_err();
    assert_eq!(err.step, Action::Run);
    assert_eq!(err.kind(), ErrorKind::JobFailed);
    assert_eq!(rt.tunnels().open_count(), 0);
    assert_eq!(mock.cancel_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_hardware_run_releases_tunnel() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockScheduler::new().with_node("c7-3"));
    mock.set_lifecycle_for("qmio-tunnel", Lifecycle::runs_forever(0))
        .await;
    mock.set_lifecycle_for("qmio-run", Lifecycle::runs_forever(0))
        .await;
    let rt = runtime(hardware_config(dir.path()), &mock);

    let attempt = timeout(
        Duration::from_secs(60),
        rt.run(RunRequest::new(BELL).backend(QPU_FELISA)),
    )
    .await;
    assert!(attempt.is_err());
    assert_eq!(mock.submit_count(), 2);

    for _ in 0..100 {
        if rt.tunnels().open_count() == 0 && mock.cancel_count() == 1 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(rt.tunnels().open_count(), 0);
    // Only the tunnel job is cancelled; the compute job keeps running.
    assert_eq!(mock.cancel_count(), 1);
    let tunnel = mock
        .submitted_scripts()
        .await
        .iter()
        .position(|s| s.name.starts_with("qmio-tunnel"));
    assert_eq!(tunnel, Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_tunnel_still_opening() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockScheduler::new());
    mock.set_lifecycle_for("qmio-tunnel", Lifecycle::completes_after(u32::MAX, 0))
        .await;
    let rt = Arc::new(runtime(hardware_config(dir.path()), &mock));

    let running = rt.clone();
    let run = tokio::spawn(async move {
        running
            .run(RunRequest::new(BELL).backend(QPU_FELISA))
            .await
    });
    sleep(Duration::from_secs(5)).await;
    assert_eq!(mock.submit_count(), 1);

    run.abort();
    let _ = run.await;
    rt.shutdown().await;
    for _ in 0..100 {
        if mock.cancel_count() > 0 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(mock.cancel_count(), 1);
    assert_eq!(rt.tunnels().open_count(), 0);
}

#[tokio::test]
async fn test_unreachable_tunnel_address_fails_before_run() {
    let dir = tempfile::tempdir().unwrap();
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = closed.local_addr().unwrap().port();
    drop(closed);

    let mock = Arc::new(MockScheduler::new());
    let mut config = config(dir.path());
    config.tunnel.mode = TunnelMode::Direct;
    config.tunnel.endpoint = Some(format!("tcp://127.0.0.1:{port}"));
    config.tunnel.verify_connection = true;
    config.tunnel.connect_timeout_secs = 2;
    let rt = runtime(config, &mock);

    let err = rt
        .run(RunRequest::new(BELL).backend(QPU_FELISA))
        .await
        .unwrap_err();
    assert_eq!(err.stage, Stage::TunnelOpening);
    assert_eq!(err.kind(), ErrorKind::TunnelUnavailable);
    assert_eq!(mock.submit_count(), 0);
    assert_eq!(rt.tunnels().open_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_tunnel_that_never_starts() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockScheduler::new());
    mock.set_lifecycle_for("qmio-tunnel", Lifecycle::completes_after(u32::MAX, 0))
        .await;
    let mut config = config(dir.path());
    config.tunnel.endpoint = Some("tcp://10.5.7.1:5556".into());
    config.tunnel.start_timeout_secs = 30;
    let rt = runtime(config, &mock);

    let err = rt
        .run(RunRequest::new(BELL).backend(QPU_FELISA))
        .await
        .unwrap_err();
    assert_eq!(err.stage, Stage::TunnelOpening);
    assert_eq!(err.kind(), ErrorKind::TunnelUnavailable);
    assert_eq!(mock.submit_count(), 1);
    assert_eq!(mock.cancel_count(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_compile_then_run_counts_sum_to_shots(shots in 1u32..100_000) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        let total = rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let mock = Arc::new(MockScheduler::new());
            mock.set_executor(fake_backend).await;
            let runtime = runtime(config(dir.path()), &mock);

            let (results, _) = runtime
                .run(
                    RunRequest::new(BELL)
                        .backend(SIMULATOR_RTCS)
                        .shots(shots)
                        .mode(RunMode::PreCompile),
                )
                .await
                .unwrap();
            results.total_shots()
        });
        prop_assert_eq!(total, u64::from(shots));
    }
}
