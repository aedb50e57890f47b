//! End-to-end rollout scenarios over the public API.

use eshift_common::config::{ConfigPatch, ManualOverride, MigrationConfig};
use eshift_common::engine::{EngineKind, GeneratedFile, RequestContext};
use eshift_common::flags::{FeatureFlags, SeededRandom};
use eshift_common::logging::init_test_logging;
use eshift_common::mock_engine::MockEngine;
use eshift_common::rollback::{
    FileStateStore, MemoryStateStore, RollbackManager, RollbackState, RollbackTrigger,
};
use eshift_common::{CircuitState, MigrationSystem};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn system_with(
    config: MigrationConfig,
    legacy: MockEngine,
    candidate: MockEngine,
) -> (MigrationSystem, Arc<MockEngine>, Arc<MockEngine>) {
    init_test_logging();
    let legacy = Arc::new(legacy);
    let candidate = Arc::new(candidate);
    let system = MigrationSystem::with_random_source(
        config,
        legacy.clone(),
        candidate.clone(),
        Arc::new(MemoryStateStore::new()),
        Arc::new(SeededRandom::new(42)),
    )
    .unwrap();
    (system, legacy, candidate)
}

#[tokio::test]
async fn zero_percent_never_uses_candidate() {
    let (system, _, candidate) = system_with(
        MigrationConfig::default(),
        MockEngine::succeeding("legacy"),
        MockEngine::succeeding("candidate"),
    );
    for i in 0..100 {
        let out = system
            .execute(Some(RequestContext::new(format!("req-{i}"))))
            .await;
        assert!(!out.migration_metadata.used_candidate);
    }
    assert_eq!(candidate.calls(), 0);
}

#[tokio::test]
async fn always_failing_candidate_falls_back_every_time() {
    let (system, legacy, candidate) = system_with(
        MigrationConfig {
            new_engine_percentage: 100,
            error_threshold: 1000,
            ..Default::default()
        },
        MockEngine::succeeding("legacy"),
        MockEngine::raising("candidate", "not implemented"),
    );
    for _ in 0..20 {
        let out = system.execute(None).await;
        assert!(out.result.success);
        assert!(!out.migration_metadata.used_candidate);
        assert!(out.migration_metadata.fallback_used);
    }
    assert_eq!(candidate.calls(), 20);
    assert_eq!(legacy.calls(), 20);
    assert_eq!(system.flags().circuit_breaker_metrics().total_errors, 20);
}

#[tokio::test]
async fn failing_candidate_trips_breaker_then_stops_receiving_traffic() {
    let (system, _, candidate) = system_with(
        MigrationConfig {
            new_engine_percentage: 100,
            error_threshold: 3,
            ..Default::default()
        },
        MockEngine::succeeding("legacy"),
        MockEngine::raising("candidate", "boom"),
    );
    for _ in 0..10 {
        assert!(system.execute(None).await.result.success);
    }
    assert_eq!(system.flags().circuit_breaker_state(), CircuitState::Open);
    assert!(system.rollback().rollback_recommended());
    assert_eq!(candidate.calls(), 3);
}

#[tokio::test]
async fn flaky_candidate_trips_breaker_despite_interleaved_successes() {
    let (system, _, candidate) = system_with(
        MigrationConfig {
            new_engine_percentage: 100,
            error_threshold: 5,
            ..Default::default()
        },
        MockEngine::succeeding("legacy"),
        MockEngine::builder("candidate")
            .failure_rate(0.5)
            .seed(3)
            .build(),
    );
    for _ in 0..200 {
        assert!(system.execute(None).await.result.success);
    }
    assert_eq!(system.flags().circuit_breaker_state(), CircuitState::Open);
    assert_eq!(candidate.failures(), 5);
}

#[tokio::test]
async fn huge_runtime_timeout_is_rejected_and_canary_keeps_working() {
    let (system, _, candidate) = system_with(
        MigrationConfig {
            canary_enabled: true,
            canary_sample_rate: 100,
            ..Default::default()
        },
        MockEngine::succeeding("legacy"),
        MockEngine::succeeding("candidate"),
    );
    let rejected = system.flags().configure(&ConfigPatch {
        canary_timeout_secs: Some(u64::MAX),
        ..Default::default()
    });
    assert!(rejected.is_err());
    assert_eq!(
        system.flags().config().canary_timeout_secs,
        MigrationConfig::default().canary_timeout_secs
    );

    let out = system.execute(None).await;
    assert!(out.result.success);
    assert!(out.migration_metadata.was_canary_test);
    assert_eq!(candidate.calls(), 1);
}

#[test]
fn two_errors_at_threshold_two_open_breaker() {
    let flags = FeatureFlags::new(MigrationConfig {
        error_threshold: 2,
        ..Default::default()
    })
    .unwrap();
    flags.record_error(EngineKind::Candidate, "first");
    flags.record_error(EngineKind::Candidate, "second");
    assert_eq!(flags.circuit_breaker_state(), CircuitState::Open);
    assert!(flags.rollback_recommended());
}

#[tokio::test]
async fn canary_result_equals_plain_legacy_result() {
    let files = vec![
        GeneratedFile::new("models/user.rb", "class User\nend\n"),
        GeneratedFile::new("models/post.rb", "class Post\nend\n"),
    ];
    let models = vec!["user".to_string(), "post".to_string()];

    let (plain, _, _) = system_with(
        MigrationConfig::default(),
        MockEngine::builder("legacy")
            .files(files.clone())
            .models(models.clone())
            .build(),
        MockEngine::succeeding("candidate"),
    );
    let (canary, _, candidate) = system_with(
        MigrationConfig {
            canary_enabled: true,
            canary_sample_rate: 100,
            ..Default::default()
        },
        MockEngine::builder("legacy")
            .files(files.clone())
            .models(models.clone())
            .build(),
        MockEngine::builder("candidate")
            .files(vec![GeneratedFile::new("models/other.rb", "different")])
            .build(),
    );

    let expected = plain.execute(None).await.result;
    let observed = canary.execute(None).await;
    assert!(observed.migration_metadata.was_canary_test);
    assert_eq!(candidate.calls(), 1);
    assert_eq!(observed.result.success, expected.success);
    assert_eq!(observed.result.generated_files, expected.generated_files);
    assert_eq!(observed.result.generated_models, expected.generated_models);
    assert_eq!(observed.result.errors, expected.errors);
}

#[tokio::test]
async fn canary_sampling_gates_candidate_execution() {
    let (system, _, candidate) = system_with(
        MigrationConfig {
            canary_enabled: true,
            canary_sample_rate: 0,
            ..Default::default()
        },
        MockEngine::succeeding("legacy"),
        MockEngine::succeeding("candidate"),
    );
    for _ in 0..50 {
        assert!(!system.execute(None).await.migration_metadata.was_canary_test);
    }
    // Not sampled means the candidate never runs at all.
    assert_eq!(candidate.calls(), 0);
}

#[tokio::test]
async fn emergency_rollback_while_healthy_forces_legacy() {
    let (system, _, candidate) = system_with(
        MigrationConfig {
            new_engine_percentage: 100,
            ..Default::default()
        },
        MockEngine::succeeding("legacy"),
        MockEngine::succeeding("candidate"),
    );
    assert!(system.execute(None).await.migration_metadata.used_candidate);

    let outcome = system
        .rollback()
        .emergency_rollback("customer reports", Some("oncall"));
    assert!(outcome.success);
    assert_eq!(system.rollback().current_state(), RollbackState::RolledBack);

    for _ in 0..20 {
        assert!(!system.execute(None).await.migration_metadata.used_candidate);
    }
    assert_eq!(candidate.calls(), 1);
}

#[test]
fn automatic_rollback_survives_restart() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rollback_state.json");

    let before = {
        let flags = Arc::new(FeatureFlags::new(MigrationConfig::default()).unwrap());
        let manager = RollbackManager::new(flags.clone(), Arc::new(FileStateStore::new(&path)));
        let before = manager.rollback_history().len();
        flags.trip_circuit_breaker();
        assert!(manager.execute_automatic_rollback().success);
        before
    };

    let flags = Arc::new(
        FeatureFlags::new(MigrationConfig {
            new_engine_percentage: 100,
            ..Default::default()
        })
        .unwrap(),
    );
    let manager = RollbackManager::new(flags.clone(), Arc::new(FileStateStore::new(&path)));
    assert_eq!(manager.current_state(), RollbackState::RolledBack);
    assert_eq!(manager.rollback_history().len(), before + 1);
    assert_eq!(
        manager.rollback_history()[0].trigger,
        RollbackTrigger::CircuitBreaker
    );
    assert_eq!(flags.config().manual_override, ManualOverride::ForceLegacy);
    assert!(!flags.routing_decision("after-restart").use_candidate);
}

#[tokio::test]
async fn full_cycle_breaker_rollback_recovery() {
    let (system, _, candidate) = system_with(
        MigrationConfig {
            new_engine_percentage: 100,
            error_threshold: 2,
            breaker_cooldown_secs: 1,
            ..Default::default()
        },
        MockEngine::succeeding("legacy"),
        MockEngine::raising("candidate", "regression"),
    );
    let monitor = system.start_monitor();

    system.execute(None).await;
    system.execute(None).await;
    assert_eq!(system.flags().circuit_breaker_state(), CircuitState::Open);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while system.rollback().current_state() != RollbackState::RolledBack
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(system.rollback().current_state(), RollbackState::RolledBack);

    // Still open: recovery is refused.
    assert!(!system.rollback().attempt_rollback_recovery().success);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(system.flags().circuit_breaker_state(), CircuitState::HalfOpen);
    let report = system.rollback().attempt_rollback_recovery();
    assert!(report.success, "{:?}", report.error);
    assert_eq!(system.rollback().current_state(), RollbackState::Healthy);
    assert_eq!(
        system.flags().config().manual_override,
        ManualOverride::None
    );

    // The next candidate request is the half-open probe; it fails and reopens.
    let calls_before = candidate.calls();
    system.execute(None).await;
    assert_eq!(candidate.calls(), calls_before + 1);
    assert_eq!(system.flags().circuit_breaker_state(), CircuitState::Open);

    monitor.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_load_keeps_counters_consistent() {
    let (system, legacy, candidate) = system_with(
        MigrationConfig {
            new_engine_percentage: 50,
            error_threshold: 10_000,
            ..Default::default()
        },
        MockEngine::succeeding("legacy"),
        MockEngine::builder("candidate")
            .failure_rate(0.2)
            .seed(9)
            .build(),
    );
    let system = Arc::new(system);
    let tasks: Vec<_> = (0..200)
        .map(|i| {
            let system = system.clone();
            tokio::spawn(async move {
                system
                    .execute(Some(RequestContext::new(format!("load-{i}"))))
                    .await
            })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().result.success);
    }

    let stats = system.statistics();
    assert_eq!(stats.adapter.executions_total, 200);
    let breaker = stats.circuit_breaker_metrics;
    assert_eq!(breaker.total_errors + breaker.total_successes, candidate.calls());
    assert_eq!(breaker.total_errors, candidate.failures());
    assert_eq!(legacy.calls(), 200 - candidate.calls() + candidate.failures());
}

#[test]
fn runtime_reconfiguration_is_all_or_nothing() {
    let flags = FeatureFlags::new(MigrationConfig::default()).unwrap();
    let before = flags.config();
    let result = flags.configure(&ConfigPatch {
        new_engine_percentage: Some(50),
        error_threshold: Some(0),
        ..Default::default()
    });
    assert!(result.is_err());
    assert_eq!(*flags.config(), *before);
}
