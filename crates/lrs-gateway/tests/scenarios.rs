//! End-to-end scenarios: pagination, configured backends, forwarding.

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;
use tempfile::TempDir;

use lrs_gateway::core::{IdentityKey, StatementQuery, Target};
use lrs_gateway::forward::memory::{Failure, MemoryTransport};
use lrs_gateway::forward::{DispatchSettings, RawForwardingEntry};
use lrs_gateway::store::{BackendRegistry, FsBackend, FsSettings, MemoryBackend, OnConflict};
use lrs_gateway::{GatewayConfig, GatewayError, StatementStore};
use lrs_gateway_testkit::fixtures::{admin, key_of, StatementFactory};
use lrs_gateway_testkit::generators::raw_statement;
use lrs_gateway_testkit::init_tracing;

fn memory_config() -> GatewayConfig {
    GatewayConfig {
        backend: "memory".into(),
        ..GatewayConfig::default()
    }
}

/// Follow cursors until a page comes back without one.
async fn drain(
    store: &StatementStore,
    mut query: StatementQuery,
    target: &Target,
) -> (Vec<Vec<IdentityKey>>, Vec<IdentityKey>) {
    let mut pages = Vec::new();
    let mut all = Vec::new();
    loop {
        let page = store.read(&admin(), &query, target).await.unwrap();
        let keys: Vec<_> = page.statements.iter().map(|s| s.id().unwrap()).collect();
        all.extend(keys.iter().copied());
        pages.push(keys);
        match page.cursor {
            Some(cursor) => query = query.resume(cursor),
            None => break,
        }
        assert!(pages.len() <= 50, "pagination does not terminate");
    }
    (pages, all)
}

// ─────────────────────────────────────────────────────────────────────────────
// Pagination
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_hundred_statements_in_pages_of_25() {
    init_tracing();
    let store = StatementStore::new(Arc::new(MemoryBackend::new()), memory_config()).unwrap();
    let target = Target::default();
    let batch = StatementFactory::new().batch(100);
    let written: HashSet<_> = batch.iter().map(key_of).collect();
    store.write(&admin(), batch, &target).await.unwrap();

    let query = StatementQuery {
        limit: 25,
        ..StatementQuery::default()
    };
    let (pages, all) = drain(&store, query, &target).await;

    let first_four: HashSet<_> = pages[..4].iter().flatten().copied().collect();
    assert_eq!(first_four, written);
    assert!(pages[..4].iter().all(|page| page.len() == 25));
    assert!(pages[4..].iter().all(Vec::is_empty));
    assert_eq!(all.len(), 100);
}

#[tokio::test]
async fn test_pages_follow_sort_order() {
    let store = StatementStore::new(Arc::new(MemoryBackend::new()), memory_config()).unwrap();
    let target = Target::default();
    let batch = StatementFactory::new().batch(12);
    store.write(&admin(), batch.clone(), &target).await.unwrap();

    let oldest_first: Vec<_> = batch.iter().map(key_of).collect();
    let ascending = StatementQuery {
        limit: 5,
        ascending: true,
        ..StatementQuery::default()
    };
    let (_, all) = drain(&store, ascending, &target).await;
    assert_eq!(all, oldest_first);

    let descending = StatementQuery {
        limit: 5,
        ..StatementQuery::default()
    };
    let (_, all) = drain(&store, descending, &target).await;
    assert_eq!(all, oldest_first.into_iter().rev().collect::<Vec<_>>());
}

#[tokio::test]
async fn test_voided_records_never_cause_omissions() {
    let store = StatementStore::new(Arc::new(MemoryBackend::new()), memory_config()).unwrap();
    let target = Target::default();
    let factory = StatementFactory::new();
    let batch = factory.batch(10);
    store.write(&admin(), batch.clone(), &target).await.unwrap();
    let voids = vec![
        factory.voiding(key_of(&batch[8]), 20),
        factory.voiding(key_of(&batch[9]), 21),
    ];
    store.write(&admin(), voids.clone(), &target).await.unwrap();

    let query = StatementQuery {
        limit: 5,
        ..StatementQuery::default()
    };
    let (pages, all) = drain(&store, query, &target).await;

    // The first page reads two voids and three originals, two of which
    // are hidden, yet still carries a cursor.
    assert_eq!(pages[0].len(), 3);
    let unique: HashSet<_> = all.iter().copied().collect();
    let mut expected: HashSet<_> = batch[..8].iter().map(key_of).collect();
    expected.extend(voids.iter().map(key_of));
    assert_eq!(unique, expected);
}

#[tokio::test]
async fn test_limit_is_clamped_to_max() {
    let mut config = memory_config();
    config.read.max_limit = 10;
    let store = StatementStore::new(Arc::new(MemoryBackend::new()), config).unwrap();
    let target = Target::default();
    store
        .write(&admin(), StatementFactory::new().batch(15), &target)
        .await
        .unwrap();

    let unbounded = StatementQuery::default();
    let page = store.read(&admin(), &unbounded, &target).await.unwrap();
    assert_eq!(page.len(), 10);
    assert!(page.has_more());

    let large = StatementQuery {
        limit: 500,
        ..StatementQuery::default()
    };
    assert_eq!(store.read(&admin(), &large, &target).await.unwrap().len(), 10);
}

// ─────────────────────────────────────────────────────────────────────────────
// Configured backends
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sqlite_from_configuration() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lrs.db");
    let config = GatewayConfig::from_toml_str(&format!(
        r#"
        backend = "sqlite"
        default_target = "tenant_a"

        [write]
        concurrency = 2
        chunk_size = 8

        [backends.sqlite]
        path = {path:?}
        "#,
        path = path.display().to_string()
    ))
    .unwrap();

    let store = StatementStore::open(config.clone()).unwrap();
    let target = store.default_target().clone();
    assert_eq!(target.as_str(), "tenant_a");

    let batch = StatementFactory::new().batch(30);
    let result = store.write(&admin(), batch.clone(), &target).await.unwrap();
    assert_eq!(result.written, 30);

    let query = StatementQuery {
        limit: 7,
        ..StatementQuery::default()
    };
    let (_, all) = drain(&store, query.clone(), &target).await;
    let expected: HashSet<_> = batch.iter().map(key_of).collect();
    assert_eq!(all.iter().copied().collect::<HashSet<_>>(), expected);
    drop(store);

    // Data survives reopening.
    let reopened = StatementStore::open(config).unwrap();
    let again = reopened.write(&admin(), batch, &target).await.unwrap();
    assert_eq!(again.written, 0);
    assert_eq!(again.duplicates, 30);
}

#[test]
fn test_unknown_backend_fails_at_resolution() {
    let config = GatewayConfig {
        backend: "cassandra".into(),
        ..GatewayConfig::default()
    };
    let err = StatementStore::open(config).unwrap_err();
    assert!(matches!(err, GatewayError::Configuration(ref m) if m.contains("cassandra")), "{err}");
}

#[test]
fn test_unsupported_conflict_policy_fails_at_construction() {
    let dir = TempDir::new().unwrap();
    let backend = FsBackend::open(&FsSettings {
        root: dir.path().to_path_buf(),
        ..FsSettings::default()
    })
    .unwrap();
    let mut config = GatewayConfig {
        backend: "fs".into(),
        ..GatewayConfig::default()
    };
    config.write.on_conflict = OnConflict::Overwrite;

    let err = StatementStore::new(Arc::new(backend), config).unwrap_err();
    assert!(matches!(err, GatewayError::Configuration(_)));
}

#[tokio::test]
async fn test_custom_registry_backend() {
    let mut registry = BackendRegistry::with_builtin(Default::default());
    let shared = Arc::new(MemoryBackend::new());
    registry.register_instance("shared", shared.clone());

    let config = GatewayConfig {
        backend: "shared".into(),
        ..GatewayConfig::default()
    };
    let store = StatementStore::open_with(config, &registry).unwrap();
    store
        .write(&admin(), StatementFactory::new().batch(3), &Target::default())
        .await
        .unwrap();
    assert_eq!(shared.len(&Target::default()), 3);
}

// ─────────────────────────────────────────────────────────────────────────────
// Forwarding
// ─────────────────────────────────────────────────────────────────────────────

const DOWN: &str = "http://down.example.com/xAPI/statements";
const UP: &str = "http://up.example.com/xAPI/statements";

fn forwarding_entry(url: &str) -> RawForwardingEntry {
    RawForwardingEntry {
        is_active: Some(true),
        url: Some(url.to_string()),
        basic_username: Some("gateway".into()),
        basic_password: Some("secret".into()),
        max_retries: Some(2),
        timeout: Some(1.0),
    }
}

fn forwarding_config() -> GatewayConfig {
    GatewayConfig {
        backend: "memory".into(),
        dispatch: DispatchSettings {
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            failure_log_capacity: 10,
        },
        forwarding: vec![
            forwarding_entry(DOWN),
            forwarding_entry(UP),
            RawForwardingEntry {
                url: Some("http://incomplete.example.com".into()),
                ..RawForwardingEntry::default()
            },
        ],
        ..GatewayConfig::default()
    }
}

#[tokio::test]
async fn test_forwarding_failure_is_isolated_from_write() {
    let transport = Arc::new(MemoryTransport::new());
    transport.fail(DOWN, Failure::Status(500));
    let store = StatementStore::new(Arc::new(MemoryBackend::new()), forwarding_config())
        .unwrap()
        .with_transport(transport.clone());
    assert_eq!(store.dispatcher().targets().len(), 2);

    let batch = StatementFactory::new().batch(3);
    let result = store
        .write(&admin(), batch.clone(), &Target::default())
        .await
        .unwrap();
    assert_eq!(result.written, 3);

    let report = result.forwarding.wait().await;
    assert_eq!(report.delivered, vec![UP.to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].attempts, 3);

    let delivered: Vec<_> = transport
        .delivered(UP)
        .iter()
        .map(|s| s.id().unwrap())
        .collect();
    assert_eq!(delivered, batch.iter().map(key_of).collect::<Vec<_>>());
    assert!(transport.delivered(UP).iter().all(|s| s.authority().is_some()));

    let failures = store.recent_forwarding_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].url, DOWN);
}

#[tokio::test]
async fn test_duplicates_are_not_forwarded_again() {
    let transport = Arc::new(MemoryTransport::new());
    let store = StatementStore::new(Arc::new(MemoryBackend::new()), forwarding_config())
        .unwrap()
        .with_transport(transport.clone());
    let batch = StatementFactory::new().batch(2);

    store
        .write(&admin(), batch.clone(), &Target::default())
        .await
        .unwrap()
        .forwarding
        .wait()
        .await;
    let again = store.write(&admin(), batch, &Target::default()).await.unwrap();

    assert!(again.forwarding.is_empty());
    assert_eq!(transport.attempts(UP), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Properties
// ─────────────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_write_is_idempotent(batch in prop::collection::vec(raw_statement(), 1..20)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let backend = Arc::new(MemoryBackend::new());
            let store = StatementStore::new(backend.clone(), memory_config()).unwrap();
            let target = Target::default();

            let first = store.write(&admin(), batch.clone(), &target).await.unwrap();
            let second = store.write(&admin(), batch.clone(), &target).await.unwrap();

            prop_assert_eq!(first.written, batch.len());
            prop_assert_eq!(second.written, 0);
            prop_assert_eq!(second.duplicates, batch.len());
            prop_assert_eq!(backend.len(&target), batch.len());
            Ok(())
        })?;
    }
}
