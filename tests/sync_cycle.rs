//! 端到端同步测试：内存存储 + 内存数据库

use sharesync_lib::core::{
    ConcurrencyStrategy, CoordinatorSettings, DuplicatePolicy, RetryPolicy, RunCoordinator, RunOutcome, ShareConfig,
    SyncExecutor, SyncStatus,
};
use sharesync_lib::db::{SqliteStateStore, StateStore};
use sharesync_lib::storage::{build_operator, StorageConfig, StorageShareLister, StorageTransfer};
use opendal::Operator;
use std::sync::Arc;
use std::time::Duration;

const URL: &str = "https://pan.example.com/s/KEY";

struct Harness {
    source: Operator,
    destination: Operator,
    store: Arc<SqliteStateStore>,
    coordinator: RunCoordinator,
}

async fn harness(max_history: u32) -> Harness {
    let source = build_operator(&StorageConfig::memory()).unwrap();
    let destination = build_operator(&StorageConfig::memory()).unwrap();
    let store = Arc::new(SqliteStateStore::in_memory().await.unwrap());

    let lister = StorageShareLister::new(source.clone(), "memory");
    let transfer = StorageTransfer::new(source.clone(), destination.clone());
    let executor = SyncExecutor::new(
        Arc::new(transfer),
        ConcurrencyStrategy::from_pool_size(4),
        RetryPolicy::none(),
    );
    let coordinator = RunCoordinator::new(Arc::new(lister), store.clone(), executor).with_settings(CoordinatorSettings {
        max_history,
        max_parallel_shares: 1,
        courtesy_delay: Duration::ZERO,
    });

    Harness {
        source,
        destination,
        store,
        coordinator,
    }
}

async fn read(op: &Operator, path: &str) -> Vec<u8> {
    op.read(path).await.unwrap().to_vec()
}

#[tokio::test]
async fn test_first_then_incremental_sync() {
    let h = harness(100).await;
    h.source.write("KEY/docs/a.txt", b"alpha".to_vec()).await.unwrap();
    h.source.write("KEY/b.txt", b"beta".to_vec()).await.unwrap();
    let share = ShareConfig::new(URL, "inbox");

    // 首次同步转存全部文件
    let first = h.coordinator.sync_share(&share).await;
    assert_eq!(first.record.outcome, RunOutcome::Succeeded);
    assert_eq!(first.record.created, 2);
    assert_eq!(read(&h.destination, "inbox/docs/a.txt").await, b"alpha");
    assert_eq!(read(&h.destination, "inbox/b.txt").await, b"beta");
    let committed = first.snapshot.unwrap();
    assert_eq!(committed.version, 1);

    // 没有变化时不传输任何文件
    let second = h.coordinator.sync_share(&share).await;
    assert_eq!(second.record.created + second.record.updated, 0);
    assert_eq!(second.record.skipped, 2);
    assert_eq!(second.snapshot.unwrap().version, 2);

    // 修改一个文件并新增一个文件
    h.source.write("KEY/b.txt", b"beta v2".to_vec()).await.unwrap();
    h.source.write("KEY/docs/c.txt", b"gamma".to_vec()).await.unwrap();
    let third = h.coordinator.sync_share(&share).await;
    assert_eq!(third.record.updated, 1);
    assert_eq!(third.record.created, 1);
    assert_eq!(third.record.skipped, 1);
    assert_eq!(read(&h.destination, "inbox/b.txt").await, b"beta v2");
    assert_eq!(read(&h.destination, "inbox/docs/c.txt").await, b"gamma");

    let resolved = share.resolve().unwrap();
    let history = h.store.recent_history(&resolved.id, 10).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].updated, 1);
}

#[tokio::test]
async fn test_remote_deletion_is_kept_in_snapshot() {
    let h = harness(100).await;
    h.source.write("KEY/a.txt", b"alpha".to_vec()).await.unwrap();
    h.source.write("KEY/b.txt", b"beta".to_vec()).await.unwrap();
    let share = ShareConfig::new(URL, "inbox");
    h.coordinator.sync_share(&share).await;

    h.source.delete("KEY/b.txt").await.unwrap();
    let outcome = h.coordinator.sync_share(&share).await;

    assert_eq!(outcome.record.outcome, RunOutcome::Succeeded);
    let snapshot = outcome.snapshot.unwrap();
    assert!(snapshot.entries.iter().any(|e| e.name == "b.txt"));
    // 目标中的文件不会被删除
    assert_eq!(read(&h.destination, "inbox/b.txt").await, b"beta");
}

#[tokio::test]
async fn test_keep_both_renames_existing_target() {
    let h = harness(100).await;
    h.source.write("KEY/b.txt", b"new".to_vec()).await.unwrap();
    h.destination.write("inbox/b.txt", b"old".to_vec()).await.unwrap();

    let mut share = ShareConfig::new(URL, "inbox");
    share.duplicate = DuplicatePolicy::KeepBoth;
    let outcome = h.coordinator.sync_share(&share).await;

    assert_eq!(outcome.results[0].status, SyncStatus::Succeeded);
    assert_eq!(outcome.results[0].stored_as.as_deref(), Some("b (1).txt"));
    assert_eq!(read(&h.destination, "inbox/b.txt").await, b"old");
    assert_eq!(read(&h.destination, "inbox/b (1).txt").await, b"new");
}

#[tokio::test]
async fn test_overwrite_replaces_existing_target() {
    let h = harness(100).await;
    h.source.write("KEY/b.txt", b"new".to_vec()).await.unwrap();
    h.destination.write("inbox/b.txt", b"old".to_vec()).await.unwrap();

    let outcome = h.coordinator.sync_share(&ShareConfig::new(URL, "inbox")).await;

    assert_eq!(outcome.record.outcome, RunOutcome::Succeeded);
    assert_eq!(read(&h.destination, "inbox/b.txt").await, b"new");
}

#[tokio::test]
async fn test_wrong_password_keeps_previous_state() {
    let h = harness(100).await;
    h.source.write("KEY/.sharepwd", b"abcd".to_vec()).await.unwrap();
    h.source.write("KEY/a.txt", b"alpha".to_vec()).await.unwrap();

    let good = ShareConfig::new(format!("{}?pwd=abcd", URL), "inbox");
    let first = h.coordinator.sync_share(&good).await;
    assert_eq!(first.record.created, 1);

    let mut wrong = good.clone();
    wrong.password = Some("zzzz".to_string());
    let failed = h.coordinator.sync_share(&wrong).await;
    assert_eq!(failed.record.outcome, RunOutcome::FetchFailed);
    assert!(failed.snapshot.is_none());

    // 提取码不同时视为另一个分享
    let id = good.resolve().unwrap().id;
    let snapshot = h.store.load_snapshot(&id).await.unwrap().unwrap();
    assert_eq!(snapshot.version, 1);
}

#[tokio::test]
async fn test_history_is_bounded() {
    let h = harness(3).await;
    h.source.write("KEY/a.txt", b"alpha".to_vec()).await.unwrap();
    let share = ShareConfig::new(URL, "inbox");

    for _ in 0..5 {
        h.coordinator.sync_share(&share).await;
    }

    let id = share.resolve().unwrap().id;
    let history = h.store.recent_history(&id, 100).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|r| r.created == 0));
}

#[tokio::test]
async fn test_run_all_with_flat_layout() {
    let h = harness(100).await;
    h.source.write("KEY/x/readme.md", b"one".to_vec()).await.unwrap();
    h.source.write("KEY/y/readme.md", b"two".to_vec()).await.unwrap();
    h.source.write("OTHER/z.txt", b"zed".to_vec()).await.unwrap();

    let mut flat = ShareConfig::new(URL, "flat");
    flat.preserve_path = false;
    flat.duplicate = DuplicatePolicy::KeepBoth;
    let other = ShareConfig::new("https://pan.example.com/s/OTHER", "other");

    let outcomes = h.coordinator.run_all(&[flat, other]).await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|(_, o)| o.record.outcome == RunOutcome::Succeeded));

    assert_eq!(read(&h.destination, "flat/readme.md").await, b"one");
    assert_eq!(read(&h.destination, "flat/readme (1).md").await, b"two");
    assert_eq!(read(&h.destination, "other/z.txt").await, b"zed");
}

#[tokio::test]
async fn test_flat_layout_overwrite_keeps_last_in_listing_order() {
    let h = harness(100).await;
    h.source.write("KEY/x/readme.md", b"one".to_vec()).await.unwrap();
    h.source.write("KEY/y/readme.md", b"two".to_vec()).await.unwrap();

    let mut flat = ShareConfig::new(URL, "flat");
    flat.preserve_path = false;
    let outcome = h.coordinator.sync_share(&flat).await;

    assert_eq!(outcome.record.outcome, RunOutcome::Succeeded);
    assert_eq!(outcome.record.created, 2);
    assert!(outcome.results.iter().all(|r| r.status == SyncStatus::Succeeded));
    // 同名文件按顺序依次写入同一个目标
    assert_eq!(read(&h.destination, "flat/readme.md").await, b"two");
    let stored = h.destination.list("flat/").await.unwrap();
    let files: Vec<_> = stored.iter().filter(|e| e.metadata().is_file()).collect();
    assert_eq!(files.len(), 1);
}
