use sqlx::sqlite::SqlitePool;
use tempfile::TempDir;

use vmscan::database::{self as db, Job, JobFilter, ScanState, VmState};
use vmscan::error::Error;

// Helper to create an isolated store per test
async fn create_test_db() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let db_path = dir.path().join("test_store.sqlite3");
    let pool = db::init_db(&db_path).await.expect("failed to init store");
    (pool, dir)
}

fn sample_job(id: &str, hash: &str, created_at: &str) -> Job {
    Job {
        id: id.to_string(),
        content_hash: hash.to_string(),
        original_name: "sample.bin".to_string(),
        size_bytes: 16,
        disk_path: format!("/var/lib/vmscan/disks/input-{id}.ext4"),
        vm_state: VmState::Pending,
        scan_state: ScanState::Pending,
        created_at: created_at.to_string(),
        updated_at: created_at.to_string(),
    }
}

#[actix_web::test]
async fn test_create_then_get_round_trip() {
    let (pool, _guard) = create_test_db().await;

    let job = sample_job("j1", &"ab".repeat(32), "2026-01-01T10:00:00.000Z");
    db::create_job(&pool, &job).await.unwrap();

    let fetched = db::fetch_job(&pool, "j1").await.unwrap();
    assert_eq!(fetched, job);
}

#[actix_web::test]
async fn test_create_rejects_duplicate_id() {
    let (pool, _guard) = create_test_db().await;

    let job = sample_job("j1", &"ab".repeat(32), "2026-01-01T10:00:00.000Z");
    db::create_job(&pool, &job).await.unwrap();
    let err = db::create_job(&pool, &job).await.unwrap_err();
    assert!(matches!(err, Error::Store(_)));
}

#[actix_web::test]
async fn test_fetch_unknown_job_is_not_found() {
    let (pool, _guard) = create_test_db().await;

    let err = db::fetch_job(&pool, "nope").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(id) if id == "nope"));
}

#[actix_web::test]
async fn test_vm_state_walks_the_legal_path() {
    let (pool, _guard) = create_test_db().await;
    db::create_job(
        &pool,
        &sample_job("j1", &"ab".repeat(32), "2026-01-01T10:00:00.000Z"),
    )
    .await
    .unwrap();

    db::update_vm_state(&pool, "j1", VmState::Ready).await.unwrap();
    db::update_vm_state(&pool, "j1", VmState::Running).await.unwrap();
    db::update_vm_state(&pool, "j1", VmState::Exited).await.unwrap();

    let job = db::fetch_job(&pool, "j1").await.unwrap();
    assert_eq!(job.vm_state, VmState::Exited);
}

#[actix_web::test]
async fn test_vm_state_never_reverses() {
    let (pool, _guard) = create_test_db().await;
    db::create_job(
        &pool,
        &sample_job("j1", &"ab".repeat(32), "2026-01-01T10:00:00.000Z"),
    )
    .await
    .unwrap();

    // skipping a state is refused
    let err = db::update_vm_state(&pool, "j1", VmState::Running)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    db::update_vm_state(&pool, "j1", VmState::Ready).await.unwrap();
    db::update_vm_state(&pool, "j1", VmState::Running).await.unwrap();

    // reversing is refused
    let err = db::update_vm_state(&pool, "j1", VmState::Ready)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    // repeating the current state converges
    db::update_vm_state(&pool, "j1", VmState::Running).await.unwrap();

    db::update_vm_state(&pool, "j1", VmState::Failed).await.unwrap();
    let err = db::update_vm_state(&pool, "j1", VmState::Running)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    let job = db::fetch_job(&pool, "j1").await.unwrap();
    assert_eq!(job.vm_state, VmState::Failed);
}

#[actix_web::test]
async fn test_vm_state_update_unknown_job_is_not_found() {
    let (pool, _guard) = create_test_db().await;

    let err = db::update_vm_state(&pool, "nope", VmState::Ready)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[actix_web::test]
async fn test_scan_state_round_trips_through_store() {
    let (pool, _guard) = create_test_db().await;
    db::create_job(
        &pool,
        &sample_job("j1", &"ab".repeat(32), "2026-01-01T10:00:00.000Z"),
    )
    .await
    .unwrap();

    db::update_scan_state(&pool, "j1", &ScanState::Scanning)
        .await
        .unwrap();
    db::update_scan_state(&pool, "j1", &ScanState::Suspicious(2))
        .await
        .unwrap();

    let job = db::fetch_job(&pool, "j1").await.unwrap();
    assert_eq!(job.scan_state, ScanState::Suspicious(2));
}

#[actix_web::test]
async fn test_listing_orders_newest_first_ties_by_id() {
    let (pool, _guard) = create_test_db().await;

    db::create_job(
        &pool,
        &sample_job("j-old", &"aa".repeat(32), "2026-01-01T08:00:00.000Z"),
    )
    .await
    .unwrap();
    db::create_job(
        &pool,
        &sample_job("j-b", &"bb".repeat(32), "2026-01-01T10:00:00.000Z"),
    )
    .await
    .unwrap();
    db::create_job(
        &pool,
        &sample_job("j-a", &"bb".repeat(32), "2026-01-01T10:00:00.000Z"),
    )
    .await
    .unwrap();

    let jobs = db::fetch_jobs_by_query(&pool, &JobFilter::default())
        .await
        .unwrap();
    let ids: Vec<_> = jobs.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec!["j-a", "j-b", "j-old"]);

    let recent = db::list_recent(&pool, 2).await.unwrap();
    let ids: Vec<_> = recent.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec!["j-a", "j-b"]);
}

#[actix_web::test]
async fn test_list_by_hash_finds_duplicates() {
    let (pool, _guard) = create_test_db().await;

    let hash = "cd".repeat(32);
    db::create_job(&pool, &sample_job("j1", &hash, "2026-01-01T08:00:00.000Z"))
        .await
        .unwrap();
    db::create_job(&pool, &sample_job("j2", &hash, "2026-01-01T09:00:00.000Z"))
        .await
        .unwrap();
    db::create_job(
        &pool,
        &sample_job("j3", &"ee".repeat(32), "2026-01-01T10:00:00.000Z"),
    )
    .await
    .unwrap();

    let jobs = db::list_by_hash(&pool, &hash).await.unwrap();
    let ids: Vec<_> = jobs.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec!["j2", "j1"]);
}

#[actix_web::test]
async fn test_list_by_vm_state() {
    let (pool, _guard) = create_test_db().await;

    db::create_job(
        &pool,
        &sample_job("j1", &"aa".repeat(32), "2026-01-01T08:00:00.000Z"),
    )
    .await
    .unwrap();
    db::create_job(
        &pool,
        &sample_job("j2", &"bb".repeat(32), "2026-01-01T09:00:00.000Z"),
    )
    .await
    .unwrap();
    db::update_vm_state(&pool, "j2", VmState::Ready).await.unwrap();

    let ready = db::list_by_vm_state(&pool, VmState::Ready).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, "j2");

    let pending = db::list_by_vm_state(&pool, VmState::Pending).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "j1");
}

#[actix_web::test]
async fn test_delete_job_is_final() {
    let (pool, _guard) = create_test_db().await;
    db::create_job(
        &pool,
        &sample_job("j1", &"aa".repeat(32), "2026-01-01T08:00:00.000Z"),
    )
    .await
    .unwrap();

    assert!(db::delete_job(&pool, "j1").await.unwrap());
    assert!(matches!(
        db::fetch_job(&pool, "j1").await.unwrap_err(),
        Error::NotFound(_)
    ));
    // deleting again is a no-op, not an error
    assert!(!db::delete_job(&pool, "j1").await.unwrap());
}

#[actix_web::test]
async fn test_stats_totals_by_verdict_and_vm_state() {
    let (pool, _guard) = create_test_db().await;

    for (id, created) in [
        ("j1", "2026-01-01T08:00:00.000Z"),
        ("j2", "2026-01-01T09:00:00.000Z"),
        ("j3", "2026-01-01T10:00:00.000Z"),
    ] {
        db::create_job(&pool, &sample_job(id, &"aa".repeat(32), created))
            .await
            .unwrap();
    }

    db::update_vm_state(&pool, "j1", VmState::Ready).await.unwrap();
    db::update_scan_state(&pool, "j1", &ScanState::Clean)
        .await
        .unwrap();
    db::update_vm_state(&pool, "j2", VmState::Failed).await.unwrap();
    db::update_scan_state(&pool, "j2", &ScanState::Suspicious(4))
        .await
        .unwrap();
    db::update_scan_state(&pool, "j3", &ScanState::Critical)
        .await
        .unwrap();

    let stats = db::job_stats(&pool).await.unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.vm.ready, 1);
    assert_eq!(stats.vm.failed, 1);
    assert_eq!(stats.vm.pending, 1);
    assert_eq!(stats.scan.clean, 1);
    assert_eq!(stats.scan.suspicious, 1);
    assert_eq!(stats.scan.critical, 1);
    assert_eq!(stats.scan.pending, 0);
}

#[actix_web::test]
async fn test_stats_on_empty_store() {
    let (pool, _guard) = create_test_db().await;

    let stats = db::job_stats(&pool).await.unwrap();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.vm.running, 0);
    assert_eq!(stats.scan.clean, 0);
}
