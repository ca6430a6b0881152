use guestbook_core::db::{open_db, open_db_in_memory};
use guestbook_core::{
    ConditionalWriter, Entity, EntityKey, EntityStore, GuestbookConfig, GuestbookService, Kind,
    Query, RetryConfig, SortDirection, SqliteEntityStore, StoreConfig, StoreError,
};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn greeting(id: i64, book_id: i64, timestamp: i64) -> Entity {
    Entity::new(EntityKey::numeric(Kind::Greeting, id))
        .with("book_id", book_id)
        .with("content", format!("greeting {id}"))
        .with("timestamp", timestamp)
}

#[test]
fn documents_round_trip_and_queries_filter_and_order() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteEntityStore::try_new(&conn).unwrap();

    store.put(greeting(1, 10, 300)).unwrap();
    store.put(greeting(2, 10, 100)).unwrap();
    store.put(greeting(3, 11, 200)).unwrap();
    store.put(greeting(4, 10, 200)).unwrap();

    let loaded = store
        .get(&EntityKey::numeric(Kind::Greeting, 3))
        .unwrap()
        .unwrap();
    assert_eq!(loaded, greeting(3, 11, 200));

    let query = Query::kind(Kind::Greeting)
        .filter_eq("book_id", 10)
        .order_by("timestamp", SortDirection::Descending)
        .limit(2);
    let ids = store
        .query(&query)
        .unwrap()
        .iter()
        .filter_map(|entity| entity.key.numeric_id())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![1, 4]);

    store.delete(&EntityKey::numeric(Kind::Greeting, 1)).unwrap();
    store.delete(&EntityKey::numeric(Kind::Greeting, 1)).unwrap();
    assert!(store
        .get(&EntityKey::numeric(Kind::Greeting, 1))
        .unwrap()
        .is_none());
}

#[test]
fn id_sequences_are_per_kind_and_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("guestbook.db");

    {
        let conn = open_db(&path).unwrap();
        let store = SqliteEntityStore::try_new(&conn).unwrap();
        assert_eq!(store.allocate_id(Kind::Book).unwrap(), 1);
        assert_eq!(store.allocate_id(Kind::Book).unwrap(), 2);
        assert_eq!(store.allocate_id(Kind::Greeting).unwrap(), 1);
    }

    let conn = open_db(&path).unwrap();
    let store = SqliteEntityStore::try_new(&conn).unwrap();
    assert_eq!(store.allocate_id(Kind::Book).unwrap(), 3);
}

#[test]
fn failed_transaction_rolls_back_every_write() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteEntityStore::try_new(&conn).unwrap();

    let err = store
        .transaction(|txn| {
            txn.put(greeting(1, 1, 1))?;
            txn.put(greeting(2, 1, 2))?;
            Err::<(), _>(StoreError::InvalidData("abort".to_string()))
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidData(_)));

    let all = store.query(&Query::kind(Kind::Greeting)).unwrap();
    assert!(all.is_empty());
}

#[test]
fn group_limit_fails_without_retry_or_writes() {
    let conn = open_db_in_memory().unwrap();
    let store =
        SqliteEntityStore::with_config(&conn, StoreConfig::default().with_max_groups(2)).unwrap();

    let mut attempts = 0;
    let err = store
        .transaction(|txn| {
            attempts += 1;
            for id in 1..=3 {
                txn.put(greeting(id, 1, id))?;
            }
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(
        err,
        StoreError::TooManyGroups {
            limit: 2,
            touched: 3
        }
    ));
    assert_eq!(attempts, 1);
    assert!(store.query(&Query::kind(Kind::Greeting)).unwrap().is_empty());
}

#[test]
fn write_lock_held_elsewhere_surfaces_conflict_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("busy.db");
    let holder = open_db(&path).unwrap();
    let conn = open_db(&path).unwrap();
    conn.busy_timeout(Duration::from_millis(10)).unwrap();

    let retry = RetryConfig::new()
        .with_max_retries(2)
        .with_base_delay_ms(1)
        .with_max_delay_ms(2);
    let store =
        SqliteEntityStore::with_config(&conn, StoreConfig::default().with_retry(retry)).unwrap();

    holder.execute_batch("BEGIN IMMEDIATE;").unwrap();
    let mut calls = 0;
    let err = store
        .transaction(|txn| {
            calls += 1;
            txn.put(greeting(1, 1, 1))?;
            Ok(())
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::TransactionConflict { attempts: 3 }));
    assert_eq!(calls, 0);

    holder.execute_batch("COMMIT;").unwrap();
    store
        .transaction(|txn| {
            txn.put(greeting(1, 1, 1))?;
            Ok(())
        })
        .unwrap();
    assert!(store
        .get(&EntityKey::numeric(Kind::Greeting, 1))
        .unwrap()
        .is_some());
}

#[test]
fn concurrent_connections_create_tag_exactly_once() {
    const WRITERS: usize = 4;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("race.db");
    drop(open_db(&path).unwrap());

    let barrier = Arc::new(Barrier::new(WRITERS));
    let handles = (0..WRITERS)
        .map(|writer_index| {
            let conn = open_db(&path).unwrap();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = SqliteEntityStore::try_new(&conn).unwrap();
                let key = EntityKey::named(Kind::Tag, "guests");
                barrier.wait();
                ConditionalWriter::new(&store)
                    .create_if_absent(&key, || {
                        Entity::new(key.clone())
                            .with("type", "guests")
                            .with("writer", writer_index as i64)
                    })
                    .unwrap()
            })
        })
        .collect::<Vec<_>>();

    let outcomes = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect::<Vec<_>>();
    let winners = outcomes.iter().filter(|outcome| outcome.created).count();
    assert_eq!(winners, 1);

    let winner = outcomes
        .iter()
        .find(|outcome| outcome.created)
        .map(|outcome| outcome.entity.integer("writer"))
        .unwrap();
    for outcome in &outcomes {
        assert_eq!(outcome.entity.integer("writer"), winner);
    }
}

#[test]
fn guestbook_service_runs_on_sqlite() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteEntityStore::try_new(&conn).unwrap();
    let service = GuestbookService::new(store, GuestbookConfig::default());

    let book = service.add_book("Lobby", Some("Events")).unwrap().entity;
    service.add_greeting(book.id, "first").unwrap();
    service.add_greeting("Lobby", "second").unwrap();

    let listed = service.list_greetings(&book, None).unwrap();
    let contents = listed
        .items
        .iter()
        .map(|greeting| greeting.content.as_str())
        .collect::<Vec<_>>();
    assert_eq!(contents, vec!["second", "first"]);

    let tagged = service.list_books(Some("events")).unwrap();
    assert_eq!(tagged, vec![book]);
}
