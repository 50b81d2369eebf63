mod helpers;

use helpers::meta;
use kotoba::db;
use kotoba::vocab::store::{get_unit, list_units, search_units, upsert_batch, upsert_unit};
use kotoba::vocab::types::{ExtractedUnit, JlptLevel, Unit, UnitMetadata};
use tempfile::TempDir;

#[test]
fn first_non_empty_value_wins_per_field() {
    let conn = helpers::test_db();
    let unit = Unit::new("東").unwrap();

    let payloads = [
        meta(&[], &[], None),
        meta(&[], &["east"], None),
        meta(&["とう", "ひがし"], &["west"], None),
        meta(&["あずま"], &["sunrise"], Some(JlptLevel::N4)),
        meta(&["x"], &["y"], Some(JlptLevel::N1)),
    ];
    for payload in &payloads {
        upsert_unit(&conn, "key-a", &unit, payload).unwrap();
    }

    let stored = get_unit(&conn, "key-a", &unit).unwrap().unwrap();
    assert_eq!(stored.occurrence_count, payloads.len() as u64);
    assert_eq!(stored.meanings, vec!["east"]);
    assert_eq!(stored.readings, vec!["とう", "ひがし"]);
    assert_eq!(stored.level, Some(JlptLevel::N4));
}

#[test]
fn concurrent_upserts_across_connections_count_exactly() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("vocab.db");

    // existing record with count 3
    {
        let conn = db::open_database(&db_path).unwrap();
        let unit = Unit::new("水").unwrap();
        for _ in 0..3 {
            upsert_unit(&conn, "key-a", &unit, &UnitMetadata::default()).unwrap();
        }
    }

    let writers = 16;
    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let db_path = db_path.clone();
            std::thread::spawn(move || {
                let conn = rusqlite::Connection::open(&db_path).unwrap();
                conn.busy_timeout(std::time::Duration::from_secs(10)).unwrap();
                let unit = Unit::new("水").unwrap();
                let meaning = format!("water {i}");
                let payload = meta(&["みず"], &[meaning.as_str()], Some(JlptLevel::N5));
                upsert_unit(&conn, "key-a", &unit, &payload).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let conn = db::open_database(&db_path).unwrap();
    let stored = get_unit(&conn, "key-a", &Unit::new("水").unwrap()).unwrap().unwrap();
    assert_eq!(stored.occurrence_count, 3 + writers as u64);
    assert_eq!(stored.meanings.len(), 1);
    assert!(stored.meanings[0].starts_with("water "));
}

#[test]
fn racing_first_inserts_resolve_to_one_record() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("race.db");
    db::open_database(&db_path).unwrap();

    let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let db_path = db_path.clone();
            let barrier = std::sync::Arc::clone(&barrier);
            std::thread::spawn(move || {
                let conn = rusqlite::Connection::open(&db_path).unwrap();
                conn.busy_timeout(std::time::Duration::from_secs(10)).unwrap();
                barrier.wait();
                upsert_unit(&conn, "key-a", &Unit::new("火").unwrap(), &UnitMetadata::default()).unwrap()
            })
        })
        .collect();

    let mut counts: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    counts.sort_unstable();
    // every caller saw a distinct count: exactly one insert, seven updates
    assert_eq!(counts, (1..=8).collect::<Vec<u64>>());

    let conn = db::open_database(&db_path).unwrap();
    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM vocabulary_units WHERE unit = '火'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_upserts_on_shared_connection_do_not_lose_updates() {
    let db = helpers::shared_test_db();
    let unit = Unit::new("木").unwrap();

    let batches = (0..10).map(|_| {
        let db = std::sync::Arc::clone(&db);
        let units = vec![
            ExtractedUnit::bare(unit.clone()),
            ExtractedUnit::bare(Unit::new("林").unwrap()),
        ];
        tokio::spawn(async move { upsert_batch(&db, "key-a", units).await })
    });
    for handle in futures::future::join_all(batches).await {
        let report = handle.unwrap();
        assert_eq!(report.upserted, 2);
        assert_eq!(report.failed, 0);
    }

    let conn = db.lock().unwrap();
    let listed = list_units(&conn, "key-a").unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|u| u.occurrence_count == 10));
}

#[test]
fn scopes_never_see_each_other() {
    let conn = helpers::test_db();
    let unit = Unit::new("東").unwrap();
    upsert_unit(&conn, "key-a", &unit, &meta(&["とう"], &["east"], Some(JlptLevel::N4))).unwrap();
    upsert_unit(&conn, "key-b", &unit, &meta(&["ひがし"], &["orient"], None)).unwrap();
    upsert_unit(&conn, "key-b", &unit, &UnitMetadata::default()).unwrap();
    upsert_unit(&conn, "key-b", &Unit::new("西").unwrap(), &meta(&[], &["west"], None)).unwrap();

    let a = list_units(&conn, "key-a").unwrap();
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].occurrence_count, 1);
    assert_eq!(a[0].meanings, vec!["east"]);

    assert!(search_units(&conn, "key-a", "west").unwrap().is_empty());
    assert!(search_units(&conn, "key-a", "orient").unwrap().is_empty());
    assert!(search_units(&conn, "key-b", "N4").unwrap().is_empty());
    assert_eq!(search_units(&conn, "key-b", "東").unwrap()[0].occurrence_count, 2);
    assert!(list_units(&conn, "key-c").unwrap().is_empty());
}

#[test]
fn search_is_case_insensitive_on_meanings() {
    let conn = helpers::test_db();
    upsert_unit(&conn, "key-a", &Unit::new("日").unwrap(), &meta(&["にち", "ひ"], &["Sun", "Day"], Some(JlptLevel::N5))).unwrap();

    assert_eq!(search_units(&conn, "key-a", "sun").unwrap().len(), 1);
    assert_eq!(search_units(&conn, "key-a", "DAY").unwrap().len(), 1);
    assert_eq!(search_units(&conn, "key-a", "n5").unwrap().len(), 1);
    assert_eq!(search_units(&conn, "key-a", "に").unwrap().len(), 1);
}
