//! Merge and flagging behavior against a live Postgres.
//!
//! These tests need a scratch database and are ignored by default:
//! `EBM_TEST_DATABASE_URL=postgres://... cargo test -p ebm-storage -- --ignored`
//! They drop and recreate `property_year`, so never point them at real data.

use ebm_core::{GapStatus, PropertyYearRecord};
use ebm_storage::{ensure_schema, merge, reflag, BackoffPolicy, DbSession, StorageError};
use sqlx::Row;

async fn scratch_session() -> DbSession {
    let url = std::env::var("EBM_TEST_DATABASE_URL")
        .expect("EBM_TEST_DATABASE_URL must point at a scratch database");
    let mut session = DbSession::connect_with_retry(&url, BackoffPolicy::default())
        .await
        .expect("connect");
    sqlx::query("DROP TABLE IF EXISTS property_year")
        .execute(session.connection())
        .await
        .expect("reset table");
    ensure_schema(&mut session).await.expect("ensure schema");
    session
}

fn record(property_id: i64, year: &str, name: &str) -> PropertyYearRecord {
    let mut record = PropertyYearRecord::new(property_id, year);
    record.building_name = Some(name.to_string());
    record.floor_area = Some("12000".to_string());
    record.energy_gap = GapStatus::Ok;
    record.water_gap = GapStatus::Ok;
    record
}

async fn stored_name(session: &mut DbSession, property_id: i64, year: &str) -> Option<String> {
    sqlx::query(
        "SELECT building_name FROM property_year WHERE property_id = $1 AND data_year = $2",
    )
    .bind(property_id)
    .bind(year)
    .fetch_one(session.connection())
    .await
    .expect("row present")
    .try_get("building_name")
    .expect("building_name column")
}

async fn stored_has_issue(session: &mut DbSession, property_id: i64, year: &str) -> bool {
    sqlx::query("SELECT has_issue FROM property_year WHERE property_id = $1 AND data_year = $2")
        .bind(property_id)
        .bind(year)
        .fetch_one(session.connection())
        .await
        .expect("row present")
        .try_get("has_issue")
        .expect("has_issue column")
}

async fn row_count(session: &mut DbSession) -> i64 {
    sqlx::query("SELECT count(*) AS n FROM property_year")
        .fetch_one(session.connection())
        .await
        .expect("count")
        .try_get("n")
        .expect("n column")
}

#[tokio::test]
#[ignore = "needs EBM_TEST_DATABASE_URL"]
async fn merge_is_idempotent() {
    let mut session = scratch_session().await;
    let batch = vec![record(200, "2023", "City Hall"), record(200, "2024", "City Hall")];

    let first = merge(&mut session, &batch).await.expect("first merge");
    assert_eq!(first.staged, 2);
    assert_eq!(first.committed, 2);

    let second = merge(&mut session, &batch).await.expect("second merge");
    assert_eq!(second.committed, 0, "identical rerun must write nothing");
    assert_eq!(row_count(&mut session).await, 2);
}

#[tokio::test]
#[ignore = "needs EBM_TEST_DATABASE_URL"]
async fn upsert_updates_changed_rows_in_place() {
    let mut session = scratch_session().await;
    merge(&mut session, &[record(200, "2023", "Old Name")])
        .await
        .expect("seed merge");

    let changed = merge(&mut session, &[record(200, "2023", "New Name")])
        .await
        .expect("update merge");
    assert_eq!(changed.committed, 1);
    assert_eq!(
        stored_name(&mut session, 200, "2023").await.as_deref(),
        Some("New Name")
    );
    assert_eq!(row_count(&mut session).await, 1, "update, not duplicate");

    let unchanged = merge(&mut session, &[record(200, "2023", "New Name")])
        .await
        .expect("no-op merge");
    assert_eq!(unchanged.committed, 0);
}

#[tokio::test]
#[ignore = "needs EBM_TEST_DATABASE_URL"]
async fn merge_never_deletes_missing_rows() {
    let mut session = scratch_session().await;
    merge(
        &mut session,
        &[record(200, "2023", "Kept"), record(300, "2023", "Also Kept")],
    )
    .await
    .expect("seed merge");

    merge(&mut session, &[record(200, "2024", "Fresh")])
        .await
        .expect("partial merge");

    assert_eq!(row_count(&mut session).await, 3);
    assert_eq!(
        stored_name(&mut session, 300, "2023").await.as_deref(),
        Some("Also Kept")
    );
}

#[tokio::test]
#[ignore = "needs EBM_TEST_DATABASE_URL"]
async fn has_issue_tracks_gap_indicators() {
    let mut session = scratch_session().await;

    let mut flagged = record(200, "2023", "Leaky");
    flagged.water_months_short = GapStatus::PossibleIssue;
    merge(&mut session, &[flagged.clone()]).await.expect("merge flagged");
    assert!(stored_has_issue(&mut session, 200, "2023").await);

    flagged.water_months_short = GapStatus::Ok;
    merge(&mut session, &[flagged]).await.expect("merge cleared");
    assert!(
        !stored_has_issue(&mut session, 200, "2023").await,
        "flag must clear once indicators recover"
    );

    let reflagged = reflag(&mut session).await.expect("standalone reflag");
    assert_eq!(reflagged, 0, "reflag after merge must be a no-op");
}

#[tokio::test]
#[ignore = "needs EBM_TEST_DATABASE_URL"]
async fn empty_batch_is_refused() {
    let mut session = scratch_session().await;
    let err = merge(&mut session, &[]).await.expect_err("must refuse");
    assert!(matches!(err, StorageError::EmptyBatch));
}
