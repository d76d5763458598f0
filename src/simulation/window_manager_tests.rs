//! Tests for the Temporal Window Manager
//!
//! These tests verify:
//! 1. The seed/advance scenario on a small fixture
//! 2. live == naive filter of full after every operation
//! 3. Idempotent seed/reset, residue removal
//! 4. Per-table degradation and regression guards
//! 5. Skipped tables catch up once their data is consistent again
//! 6. Store unavailability aborts; per-table store errors only warn

use super::clock::{load_manifest, ClockState, SimState, TableMode};
use super::registry::{Ident, TimestampRegistry};
use super::source::{InMemoryLoader, SourceDataset, SourceError, SourceLoad, SourceLoader};
use super::sqlite_store::{SqliteStore, StoreSettings};
use super::store::{PersistentStore, Query};
use super::table::{Table, Value};
use super::timestamp::{parse_ts, value_to_ts, SimTime, TimeRange, WindowSpan};
use super::window_manager::*;
use chrono::Duration;
use std::sync::Arc;

// =============================================================================
// FIXTURES
// =============================================================================

fn ts(s: &str) -> SimTime {
    parse_ts(s).unwrap()
}

fn ident(s: &str) -> Ident {
    Ident::new(s).unwrap()
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn table(names: &[&str], rows: Vec<Vec<Value>>) -> Table {
    Table::from_rows(names.iter().map(|n| n.to_string()).collect(), rows).unwrap()
}

fn trades() -> Table {
    table(
        &["id", "account_id", "ts"],
        vec![
            vec![Value::Integer(1), Value::Integer(10), text("2025-02-01 00:00")],
            vec![Value::Integer(2), Value::Integer(11), text("2025-02-15 00:00")],
            vec![Value::Integer(3), Value::Integer(10), text("2025-03-05 00:00")],
        ],
    )
}

fn funding() -> Table {
    table(
        &["id", "funding_fee", "ts"],
        vec![vec![Value::Integer(1), Value::Real(0.25), text("2025-02-20 00:00")]],
    )
}

fn accounts() -> Table {
    table(
        &["id", "name"],
        vec![
            vec![Value::Integer(10), text("alice")],
            vec![Value::Integer(11), text("bob")],
        ],
    )
}

fn fixture_loader() -> InMemoryLoader {
    InMemoryLoader::new()
        .with_table("Trade", trades())
        .with_table("Funding", funding())
        .with_table("Account", accounts())
}

struct Harness {
    manager: WindowManager,
    store: Arc<SqliteStore>,
}

fn harness_on(store: Arc<SqliteStore>, loader: impl SourceLoader + 'static) -> Harness {
    let shared: Arc<dyn PersistentStore> = store.clone();
    let manager = WindowManager::new(
        shared,
        Arc::new(SourceDataset::new(loader)),
        TimestampRegistry::default(),
        WindowSpan::Months(1),
    );
    Harness { manager, store }
}

fn harness(loader: impl SourceLoader + 'static) -> Harness {
    harness_on(Arc::new(SqliteStore::open_memory().unwrap()), loader)
}

fn ids(store: &SqliteStore, name: &str) -> Vec<i64> {
    let rows = store.query(&Query::all(&ident(name))).unwrap();
    let idx = rows.column_index("id").unwrap();
    let mut ids: Vec<i64> = rows.rows().iter().filter_map(|r| r[idx].as_i64()).collect();
    ids.sort();
    ids
}

fn clock(store: &SqliteStore) -> ClockState {
    ClockState::load(store).unwrap().unwrap()
}

/// Ids of `source` rows inside `[epoch, current_time)`, computed directly.
fn naive_window(source: &Table, column: &str, range: TimeRange) -> Vec<i64> {
    let t = source.column_index(column).unwrap();
    let id = source.column_index("id").unwrap();
    let mut ids: Vec<i64> = source
        .rows()
        .iter()
        .filter(|r| matches!(value_to_ts(&r[t]), Ok(Some(v)) if range.contains(&v)))
        .filter_map(|r| r[id].as_i64())
        .collect();
    ids.sort();
    ids
}

struct UnavailableLoader;

impl SourceLoader for UnavailableLoader {
    fn describe(&self) -> String {
        "unavailable".to_string()
    }

    fn load_tables(&self) -> Result<SourceLoad, SourceError> {
        Err(SourceError::Unavailable {
            source_name: "unavailable".into(),
            reason: "artifact missing".into(),
        })
    }
}

// =============================================================================
// SCENARIO
// =============================================================================

#[test]
fn test_seed_then_advance_scenario() {
    let Harness { mut manager, store } = harness(fixture_loader());

    let report = manager.seed(ts("2025-02-01")).unwrap();
    assert_eq!(report.current_time, ts("2025-03-01"));
    assert!(report.warnings.is_empty());
    assert_eq!(ids(&store, "Trade"), vec![1, 2]);
    assert_eq!(ids(&store, "Funding"), vec![1]);
    assert_eq!(ids(&store, "full_Trade"), vec![1, 2, 3]);
    assert_eq!(clock(&store).current_time, ts("2025-03-01"));

    let report = manager.advance_by(Duration::days(7)).unwrap();
    assert_eq!(report.previous_time, ts("2025-03-01"));
    assert_eq!(report.current_time, ts("2025-03-08"));
    assert_eq!(report.appended.get("Trade"), Some(&1));
    assert_eq!(report.appended.get("Funding"), Some(&0));
    assert!(!report.appended.contains_key("Account"));
    assert!(report.warnings.is_empty());

    assert_eq!(ids(&store, "Trade"), vec![1, 2, 3]);
    assert_eq!(ids(&store, "Funding"), vec![1]);
    assert_eq!(clock(&store).current_time, ts("2025-03-08"));
}

#[test]
fn test_seed_report_and_manifest() {
    let Harness { mut manager, store } = harness(fixture_loader());
    let report = manager.seed(ts("2025-02-01")).unwrap();

    let modes: Vec<(String, TableMode, usize, usize)> = report
        .tables
        .iter()
        .map(|t| (t.table.clone(), t.mode, t.full_rows, t.live_rows))
        .collect();
    assert_eq!(
        modes,
        vec![
            ("Account".to_string(), TableMode::Complete, 2, 2),
            ("Funding".to_string(), TableMode::Windowed, 1, 1),
            ("Trade".to_string(), TableMode::Windowed, 3, 2),
        ]
    );

    let manifest = load_manifest(store.as_ref()).unwrap();
    assert_eq!(manifest.len(), 3);
    assert_eq!(
        manager.list_live_tables().unwrap(),
        vec![ident("Account"), ident("Funding"), ident("Trade")]
    );
}

#[test]
fn test_timestamps_are_canonical_in_store() {
    let Harness { mut manager, store } = harness(fixture_loader());
    manager.seed(ts("2025-02-01")).unwrap();
    let rows = store
        .query(&Query::all(&ident("Trade")).order_by(&ident("ts")))
        .unwrap();
    assert_eq!(rows.rows()[0][2], text("2025-02-01 00:00:00.000000"));
}

// =============================================================================
// SUBSET INVARIANT
// =============================================================================

/// 400 trades every 5h13m from 2025-01-20, in three timestamp encodings.
fn dense_trades() -> Table {
    let base = ts("2025-01-20 00:00:00");
    let rows = (0..400i64)
        .map(|i| {
            let at = base + Duration::minutes(i * 313);
            let cell = match i % 3 {
                0 => text(&at.format("%Y-%m-%d %H:%M:%S").to_string()),
                1 => text(&at.format("%Y-%m-%dT%H:%M").to_string()),
                _ => Value::Integer(at.and_utc().timestamp()),
            };
            vec![Value::Integer(i), Value::Integer(i % 7), cell]
        })
        .collect();
    table(&["id", "account_id", "ts"], rows)
}

#[test]
fn test_live_equals_naive_filter_after_every_operation() {
    let source = dense_trades();
    let loader = InMemoryLoader::new()
        .with_table("Trade", source.clone())
        .with_table("Account", accounts());
    let Harness { mut manager, store } = harness(loader);

    let epoch = ts("2025-02-01");
    manager.seed(epoch).unwrap();
    let check = |store: &SqliteStore| {
        let now = clock(store).current_time;
        assert_eq!(
            ids(store, "Trade"),
            naive_window(&source, "ts", TimeRange::between(epoch, now)),
            "live Trade diverged at {}",
            now
        );
        assert_eq!(ids(store, "Account"), vec![10, 11]);
    };
    check(&store);

    for span in [
        Duration::days(1),
        Duration::hours(36),
        Duration::minutes(90),
        Duration::days(7),
        Duration::seconds(1),
        Duration::weeks(2),
        Duration::days(30),
    ] {
        manager.advance_by(span).unwrap();
        check(&store);
    }
}

#[test]
fn test_no_duplicate_rows_across_advances() {
    let mut rows = trades().rows().to_vec();
    // Exact duplicate source row: multiplicity 2 must be preserved, never exceeded
    rows.push(rows[2].clone());
    let source = table(&["id", "account_id", "ts"], rows);
    let Harness { mut manager, store } =
        harness(InMemoryLoader::new().with_table("Trade", source));

    manager.seed(ts("2025-02-01")).unwrap();
    for _ in 0..10 {
        manager.advance_by(Duration::days(1)).unwrap();
    }
    assert_eq!(ids(&store, "Trade"), vec![1, 2, 3, 3]);
    manager.advance_by(Duration::days(30)).unwrap();
    assert_eq!(ids(&store, "Trade"), vec![1, 2, 3, 3]);
}

#[test]
fn test_clock_is_monotonic() {
    let Harness { mut manager, store } = harness(fixture_loader());
    manager.seed(ts("2025-02-01")).unwrap();

    let mut last = clock(&store).current_time;
    for days in [1, 3, 365] {
        let report = manager.advance_by(Duration::days(days)).unwrap();
        assert!(report.current_time > last);
        assert_eq!(report.previous_time, last);
        last = report.current_time;
    }
    // Far past the data: no rows, clock still moves
    assert_eq!(ids(&store, "Trade"), vec![1, 2, 3]);
    assert_eq!(last, ts("2026-03-05"));
}

// =============================================================================
// SEED / RESET
// =============================================================================

#[test]
fn test_seed_is_idempotent() {
    let Harness { mut manager, store } = harness(fixture_loader());
    let first = manager.seed(ts("2025-02-01")).unwrap();
    let snapshot = |store: &SqliteStore| {
        (
            store.query(&Query::all(&ident("Trade"))).unwrap(),
            store.query(&Query::all(&ident("Funding"))).unwrap(),
            store.query(&Query::all(&ident("Account"))).unwrap(),
            clock(store),
        )
    };
    let before = snapshot(&store);
    let second = manager.seed(ts("2025-02-01")).unwrap();
    assert_eq!(before, snapshot(&store));
    assert_eq!(first.tables, second.tables);
}

#[test]
fn test_reset_discards_later_windows() {
    let Harness { mut manager, store } = harness(fixture_loader());
    manager.seed(ts("2025-02-01")).unwrap();
    manager.advance_by(Duration::days(30)).unwrap();
    assert_eq!(ids(&store, "Trade"), vec![1, 2, 3]);

    let report = manager.reset(ts("2025-02-10")).unwrap();
    assert_eq!(report.current_time, ts("2025-03-10"));
    assert_eq!(ids(&store, "Trade"), vec![2, 3]);
    assert_eq!(ids(&store, "Funding"), vec![1]);

    manager.reset(ts("2025-02-01")).unwrap();
    assert_eq!(ids(&store, "Trade"), vec![1, 2]);
    assert_eq!(clock(&store), ClockState::new(ts("2025-02-01"), ts("2025-03-01")));
}

#[test]
fn test_reset_drops_tables_missing_from_source() {
    let store = Arc::new(SqliteStore::open_memory().unwrap());
    let Harness { mut manager, .. } = harness_on(
        store.clone(),
        fixture_loader().with_table("Legacy", accounts()),
    );
    manager.seed(ts("2025-02-01")).unwrap();
    assert!(store.table_exists(&ident("full_Legacy")).unwrap());

    let Harness { mut manager, .. } = harness_on(store.clone(), fixture_loader());
    let report = manager.reset(ts("2025-02-01")).unwrap();
    assert_eq!(report.dropped, vec!["Legacy".to_string()]);
    let tables = store.list_tables().unwrap();
    assert!(!tables.contains("Legacy"));
    assert!(!tables.contains("full_Legacy"));
}

#[test]
fn test_day_window_span() {
    let Harness { mut manager, store } = harness(fixture_loader());
    manager.set_window(WindowSpan::Days(14));
    let report = manager.seed(ts("2025-02-01")).unwrap();
    assert_eq!(report.current_time, ts("2025-02-15"));
    // 02-15 is the exclusive upper bound
    assert_eq!(ids(&store, "Trade"), vec![1]);
}

#[test]
fn test_rows_on_window_boundaries() {
    let on_boundaries = table(
        &["id", "ts"],
        vec![
            vec![Value::Integer(1), text("2025-02-01 00:00:00")],
            vec![Value::Integer(2), text("2025-03-01 00:00:00")],
            vec![Value::Integer(3), text("2025-03-08 00:00:00")],
            vec![Value::Integer(4), text("2025-03-08 00:00:00.000001")],
        ],
    );
    let Harness { mut manager, store } =
        harness(InMemoryLoader::new().with_table("Trade", on_boundaries));

    // Epoch is inclusive, the window end is not
    manager.seed(ts("2025-02-01")).unwrap();
    assert_eq!(ids(&store, "Trade"), vec![1]);

    // A row exactly at the new clock stays hidden until the clock passes it
    let report = manager.advance_by(Duration::days(7)).unwrap();
    assert_eq!(report.current_time, ts("2025-03-08"));
    assert_eq!(ids(&store, "Trade"), vec![1, 2]);

    let report = manager.advance_by(Duration::seconds(1)).unwrap();
    assert_eq!(report.appended.get("Trade"), Some(&2));
    assert_eq!(ids(&store, "Trade"), vec![1, 2, 3, 4]);
}

// =============================================================================
// TABLES WITHOUT USABLE TIMESTAMPS
// =============================================================================

#[test]
fn test_timestamp_less_tables_stay_complete() {
    let Harness { mut manager, store } = harness(fixture_loader());
    manager.seed(ts("2025-02-01")).unwrap();
    assert_eq!(ids(&store, "Account"), ids(&store, "full_Account"));
    manager.advance_by(Duration::days(3)).unwrap();
    assert_eq!(ids(&store, "Account"), ids(&store, "full_Account"));
    manager.reset(ts("2024-01-01")).unwrap();
    assert_eq!(ids(&store, "Account"), vec![10, 11]);
}

#[test]
fn test_unparseable_timestamps_degrade_to_full_copy() {
    let bad_funding = table(
        &["id", "ts"],
        vec![
            vec![Value::Integer(1), text("2025-02-20 00:00")],
            vec![Value::Integer(2), text("sometime in march")],
        ],
    );
    let loader = InMemoryLoader::new()
        .with_table("Trade", trades())
        .with_table("Funding", bad_funding);
    let Harness { mut manager, store } = harness(loader);

    let report = manager.seed(ts("2025-02-01")).unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].table, "Funding");
    assert_eq!(report.warnings[0].kind, WarningKind::UnknownTimestampFormat);
    assert_eq!(ids(&store, "Funding"), vec![1, 2]);
    assert_eq!(ids(&store, "Trade"), vec![1, 2]);

    let manifest = load_manifest(store.as_ref()).unwrap();
    let funding = manifest.iter().find(|e| e.name.as_str() == "Funding").unwrap();
    assert_eq!(funding.mode, TableMode::Degraded);

    let report = manager.advance_by(Duration::days(7)).unwrap();
    assert!(!report.appended.contains_key("Funding"));
    assert_eq!(ids(&store, "Funding"), vec![1, 2]);
    assert_eq!(ids(&store, "Trade"), vec![1, 2, 3]);
}

#[test]
fn test_missing_timestamp_column_degrades() {
    let no_ts = table(&["id"], vec![vec![Value::Integer(1)]]);
    let Harness { mut manager, store } =
        harness(InMemoryLoader::new().with_table("Reward", no_ts));
    let report = manager.seed(ts("2025-02-01")).unwrap();
    assert_eq!(report.warnings[0].kind, WarningKind::UnknownTimestampFormat);
    assert_eq!(report.tables[0].mode, TableMode::Degraded);
    assert_eq!(ids(&store, "Reward"), vec![1]);
}

#[test]
fn test_rejected_source_table_is_partial_load() {
    let loader = fixture_loader().with_table("sim_clock", accounts());
    let Harness { mut manager, store } = harness(loader);
    let report = manager.seed(ts("2025-02-01")).unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].kind, WarningKind::PartialLoad);
    assert_eq!(report.tables.len(), 3);
    // The real clock row survived
    assert_eq!(clock(&store).current_time, ts("2025-03-01"));
}

#[test]
fn test_case_only_name_collision_is_partial_load() {
    let loader = fixture_loader().with_table("trade", accounts());
    let Harness { mut manager, store } = harness(loader);
    let report = manager.seed(ts("2025-02-01")).unwrap();

    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].table, "trade");
    assert_eq!(report.warnings[0].kind, WarningKind::PartialLoad);
    assert_eq!(ids(&store, "full_Trade"), vec![1, 2, 3]);
    assert_eq!(ids(&store, "Trade"), vec![1, 2]);

    let report = manager.advance_by(Duration::days(7)).unwrap();
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert_eq!(ids(&store, "Trade"), vec![1, 2, 3]);
}

#[test]
fn test_reset_after_case_only_rename_keeps_table() {
    let store = Arc::new(SqliteStore::open_memory().unwrap());
    let Harness { mut manager, .. } =
        harness_on(store.clone(), InMemoryLoader::new().with_table("account", accounts()));
    manager.seed(ts("2025-02-01")).unwrap();

    let Harness { mut manager, .. } =
        harness_on(store.clone(), InMemoryLoader::new().with_table("Account", accounts()));
    let report = manager.reset(ts("2025-02-01")).unwrap();
    assert!(report.dropped.is_empty());
    assert_eq!(ids(&store, "Account"), vec![10, 11]);
    assert_eq!(ids(&store, "full_Account"), vec![10, 11]);
}

// =============================================================================
// REGRESSION GUARDS
// =============================================================================

#[test]
fn test_out_of_band_full_row_is_regression() {
    let Harness { mut manager, store } = harness(fixture_loader());
    manager.seed(ts("2025-02-01")).unwrap();

    let late_insert = table(
        &["id", "account_id", "ts"],
        vec![vec![Value::Integer(99), Value::Integer(12), text("2025-02-10 00:00:00.000000")]],
    );
    store.append_rows(&ident("full_Trade"), &late_insert).unwrap();

    let report = manager.advance_by(Duration::days(7)).unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].table, "Trade");
    assert_eq!(report.warnings[0].kind, WarningKind::ClockRegressionDetected);
    assert!(!report.appended.contains_key("Trade"));
    assert_eq!(report.appended.get("Funding"), Some(&0));

    // Trade untouched, clock still advanced for everyone else
    assert_eq!(ids(&store, "Trade"), vec![1, 2]);
    assert_eq!(report.current_time, ts("2025-03-08"));
}

#[test]
fn test_skipped_table_catches_up_once_consistent() {
    let Harness { mut manager, store } = harness(fixture_loader());
    manager.seed(ts("2025-02-01")).unwrap();
    let original = store.query(&Query::all(&ident("full_Trade"))).unwrap();

    let late_insert = table(
        &["id", "account_id", "ts"],
        vec![vec![Value::Integer(99), Value::Integer(12), text("2025-02-10 00:00:00.000000")]],
    );
    store.append_rows(&ident("full_Trade"), &late_insert).unwrap();
    let report = manager.advance_by(Duration::days(7)).unwrap();
    assert_eq!(report.warnings[0].kind, WarningKind::ClockRegressionDetected);
    assert_eq!(ids(&store, "Trade"), vec![1, 2]);

    // Full data restored: the missed 03-05 row shows up on the next advance
    store.replace_table(&ident("full_Trade"), &original).unwrap();
    let report = manager.advance_by(Duration::days(7)).unwrap();
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert_eq!(report.current_time, ts("2025-03-15"));
    assert_eq!(report.appended.get("Trade"), Some(&1));
    assert_eq!(ids(&store, "Trade"), vec![1, 2, 3]);

    // And nothing is appended twice afterwards
    let report = manager.advance_by(Duration::days(7)).unwrap();
    assert_eq!(report.appended.get("Trade"), Some(&0));
    assert_eq!(ids(&store, "Trade"), vec![1, 2, 3]);
}

#[test]
fn test_late_row_after_live_max_is_revealed() {
    let Harness { mut manager, store } = harness(fixture_loader());
    manager.seed(ts("2025-02-01")).unwrap();

    // Behind the clock but after everything Trade shows: still owed
    let late_insert = table(
        &["id", "account_id", "ts"],
        vec![vec![Value::Integer(98), Value::Integer(12), text("2025-02-20 00:00:00.000000")]],
    );
    store.append_rows(&ident("full_Trade"), &late_insert).unwrap();

    let report = manager.advance_by(Duration::days(7)).unwrap();
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert_eq!(report.appended.get("Trade"), Some(&2));
    assert_eq!(ids(&store, "Trade"), vec![1, 2, 3, 98]);
}

#[test]
fn test_live_ahead_of_clock_is_regression() {
    let Harness { mut manager, store } = harness(fixture_loader());
    manager.seed(ts("2025-02-01")).unwrap();

    let ahead = table(
        &["id", "account_id", "ts"],
        vec![vec![Value::Integer(50), Value::Integer(10), text("2025-03-20 00:00:00.000000")]],
    );
    store.append_rows(&ident("Trade"), &ahead).unwrap();

    // Fresh manager: cursor must be recovered from the store
    let shared: Arc<dyn PersistentStore> = store.clone();
    let mut fresh = WindowManager::new(
        shared,
        Arc::new(SourceDataset::new(UnavailableLoader)),
        TimestampRegistry::default(),
        WindowSpan::default(),
    );
    let report = fresh.advance_by(Duration::days(7)).unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].kind, WarningKind::ClockRegressionDetected);
    assert!(report.warnings[0].detail.contains("2025-03-20"));
    assert_eq!(fresh.cursor(&ident("Trade")), Some(Some(ts("2025-03-20"))));
    drop(manager);
}

// =============================================================================
// ERRORS, STARTUP, CURSORS
// =============================================================================

#[test]
fn test_locked_store_aborts_advance_and_reset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sim.db");
    let settings = StoreSettings {
        retry_attempts: 2,
        retry_backoff_ms: 1,
        busy_timeout_ms: 10,
    };
    let store = Arc::new(SqliteStore::open(&path, settings).unwrap());
    let Harness { mut manager, store } = harness_on(store, fixture_loader());
    manager.seed(ts("2025-02-01")).unwrap();

    let blocker = rusqlite::Connection::open(&path).unwrap();
    blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();

    let err = manager.advance_by(Duration::days(7)).unwrap_err();
    assert!(matches!(err, SimulationError::StoreUnavailable(_)), "{}", err);
    let err = manager.reset(ts("2025-02-10")).unwrap_err();
    assert!(matches!(err, SimulationError::StoreUnavailable(_)), "{}", err);

    blocker.execute_batch("ROLLBACK").unwrap();
    assert_eq!(clock(&store).current_time, ts("2025-03-01"));
    assert_eq!(ids(&store, "Trade"), vec![1, 2]);

    // Lock gone: the same advance goes through
    let report = manager.advance_by(Duration::days(7)).unwrap();
    assert_eq!(report.appended.get("Trade"), Some(&1));
    assert_eq!(clock(&store).current_time, ts("2025-03-08"));
}

#[test]
fn test_per_table_store_error_only_warns() {
    let Harness { mut manager, store } = harness(fixture_loader());
    manager.seed(ts("2025-02-01")).unwrap();
    store.drop_table(&ident("full_Funding")).unwrap();

    let report = manager.advance_by(Duration::days(7)).unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].table, "Funding");
    assert_eq!(report.warnings[0].kind, WarningKind::AppendFailed);
    assert!(!report.appended.contains_key("Funding"));

    // Other tables and the clock moved on
    assert_eq!(report.appended.get("Trade"), Some(&1));
    assert_eq!(ids(&store, "Trade"), vec![1, 2, 3]);
    assert_eq!(ids(&store, "Funding"), vec![1]);
    assert_eq!(clock(&store).current_time, ts("2025-03-08"));
}

#[test]
fn test_invalid_durations_and_unseeded() {
    let Harness { mut manager, .. } = harness(fixture_loader());
    assert!(matches!(
        manager.advance_by(Duration::days(1)),
        Err(SimulationError::NotSeeded)
    ));
    manager.seed(ts("2025-02-01")).unwrap();
    assert!(matches!(
        manager.advance_by(Duration::zero()),
        Err(SimulationError::InvalidDuration(_))
    ));
    assert!(matches!(
        manager.advance_by(Duration::hours(-2)),
        Err(SimulationError::InvalidDuration(_))
    ));
}

#[test]
fn test_source_unavailable_is_fatal_to_seed() {
    let Harness { mut manager, .. } = harness(UnavailableLoader);
    let err = manager.seed(ts("2025-02-01")).unwrap_err();
    assert!(matches!(err, SimulationError::SourceUnavailable(_)));
    assert_eq!(manager.status().state, SimState::Uninitialized);
}

#[test]
fn test_ensure_seeded_resumes_existing_state() {
    let store = Arc::new(SqliteStore::open_memory().unwrap());
    let Harness { mut manager, .. } = harness_on(store.clone(), fixture_loader());
    let outcome = manager.ensure_seeded(ts("2025-02-01")).unwrap();
    assert!(matches!(outcome, StartupOutcome::Seeded(_)));
    manager.advance_by(Duration::days(7)).unwrap();

    // Second process: never touches the source, keeps the advanced clock
    let Harness { mut manager, .. } = harness_on(store.clone(), UnavailableLoader);
    let outcome = manager.ensure_seeded(ts("2025-02-01")).unwrap();
    assert_eq!(
        outcome,
        StartupOutcome::Resumed(ClockState::new(ts("2025-02-01"), ts("2025-03-08")))
    );
    let report = manager.advance_by(Duration::days(7)).unwrap();
    assert_eq!(report.current_time, ts("2025-03-15"));
    assert_eq!(ids(&store, "Trade"), vec![1, 2, 3]);
}

#[test]
fn test_cursors_track_live_max() {
    let Harness { mut manager, .. } = harness(fixture_loader());
    assert_eq!(manager.cursor(&ident("Trade")), None);
    manager.seed(ts("2025-02-01")).unwrap();
    assert_eq!(manager.cursor(&ident("Trade")), Some(Some(ts("2025-02-15"))));
    assert_eq!(manager.cursor(&ident("Account")), None);

    manager.advance_by(Duration::days(7)).unwrap();
    assert_eq!(manager.cursor(&ident("Trade")), Some(Some(ts("2025-03-05"))));

    manager.reset(ts("2024-01-01")).unwrap();
    assert_eq!(manager.cursor(&ident("Trade")), Some(None));
}

#[test]
fn test_status_and_current_time() {
    let Harness { mut manager, .. } = harness(fixture_loader());
    assert_eq!(manager.current_time().unwrap(), None);
    assert_eq!(manager.status().state, SimState::Uninitialized);

    manager.seed(ts("2025-02-01")).unwrap();
    let status = manager.status();
    assert_eq!(status.state, SimState::Running);
    assert_eq!(status.epoch.as_deref(), Some("2025-02-01 00:00:00.000000"));
    assert_eq!(manager.current_time().unwrap(), Some(ts("2025-03-01")));
    assert_eq!(
        manager.live_view().current_time().unwrap(),
        Some(ts("2025-03-01"))
    );
}
