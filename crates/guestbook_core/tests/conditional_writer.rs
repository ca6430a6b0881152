use guestbook_core::model::guestbook::{book_key, book_name_key, Book, Greeting};
use guestbook_core::{
    ConditionalWriter, Entity, EntityKey, EntityStore, Kind, MemoryEntityStore, Query,
    RenameResult, RetryConfig, StoreConfig, StoreError,
};
use std::sync::{Arc, Barrier};
use std::thread;

const RACERS: usize = 8;

fn contended_store() -> Arc<MemoryEntityStore> {
    let retry = RetryConfig::new()
        .with_max_retries(RACERS * 2)
        .with_base_delay_ms(1)
        .with_max_delay_ms(5);
    Arc::new(MemoryEntityStore::with_config(
        StoreConfig::default().with_retry(retry),
    ))
}

fn seed_book(store: &MemoryEntityStore, name: &str, greetings: &[(&str, i64)]) -> Book {
    let outcome = ConditionalWriter::new(store)
        .create_unique(&book_name_key(name), Kind::Book, |id| {
            Book::new(id, name).to_entity()
        })
        .unwrap();
    let book = Book::from_entity(&outcome.entity).unwrap();
    for (content, timestamp) in greetings {
        let greeting = Greeting {
            id: store.allocate_id(Kind::Greeting).unwrap(),
            book_id: book.id,
            content: content.to_string(),
            timestamp: *timestamp,
        };
        store.put(greeting.to_entity()).unwrap();
    }
    book
}

fn greetings_of(store: &MemoryEntityStore, book_id: i64) -> Vec<Greeting> {
    store
        .query(&Query::kind(Kind::Greeting).filter_eq("book_id", book_id))
        .unwrap()
        .iter()
        .map(|entity| Greeting::from_entity(entity).unwrap())
        .collect()
}

#[test]
fn racing_create_if_absent_has_exactly_one_winner() {
    let store = contended_store();
    let barrier = Arc::new(Barrier::new(RACERS));
    let key = EntityKey::named(Kind::Tag, "party");

    let handles = (0..RACERS)
        .map(|racer| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            let key = key.clone();
            thread::spawn(move || {
                barrier.wait();
                ConditionalWriter::new(&store)
                    .create_if_absent(&key, || {
                        Entity::new(key.clone())
                            .with("type", "party")
                            .with("racer", racer as i64)
                    })
                    .unwrap()
            })
        })
        .collect::<Vec<_>>();
    let outcomes = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect::<Vec<_>>();

    let winners = outcomes
        .iter()
        .filter(|outcome| outcome.created)
        .collect::<Vec<_>>();
    assert_eq!(winners.len(), 1);

    let stored = store.get(&key).unwrap().unwrap();
    assert_eq!(stored, winners[0].entity);
    assert!(outcomes.iter().all(|outcome| outcome.entity == stored));
}

#[test]
fn racing_create_unique_writes_one_entity_and_one_index_entry() {
    let store = contended_store();
    let barrier = Arc::new(Barrier::new(RACERS));

    let handles = (0..RACERS)
        .map(|_| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                ConditionalWriter::new(&store)
                    .create_unique(&book_name_key("Visitors"), Kind::Book, |id| {
                        Book::new(id, "Visitors").to_entity()
                    })
                    .unwrap()
            })
        })
        .collect::<Vec<_>>();
    let outcomes = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect::<Vec<_>>();

    assert_eq!(outcomes.iter().filter(|outcome| outcome.created).count(), 1);
    let books = store.query(&Query::kind(Kind::Book)).unwrap();
    assert_eq!(books.len(), 1);
    assert!(outcomes
        .iter()
        .all(|outcome| outcome.entity.key == books[0].key));
    assert_eq!(store.query(&Query::kind(Kind::BookName)).unwrap().len(), 1);
}

#[test]
fn in_place_rename_keeps_id_and_moves_index_entry() {
    let store = MemoryEntityStore::new();
    let book = seed_book(&store, "A", &[("hi", 10)]);

    let result = ConditionalWriter::new(&store)
        .rename_if_absent_at_target(book.id, "B", false)
        .unwrap();

    let RenameResult::Renamed(renamed) = result else {
        panic!("rename should succeed");
    };
    assert_eq!(renamed.id, book.id);
    assert_eq!(renamed.name, "B");
    assert!(store.get(&book_name_key("A")).unwrap().is_none());
    assert!(store.get(&book_name_key("B")).unwrap().is_some());
    assert_eq!(greetings_of(&store, book.id).len(), 1);
}

#[test]
fn copy_children_rename_moves_greetings_with_original_timestamps() {
    let store = MemoryEntityStore::new();
    let old = seed_book(&store, "A", &[("first", 100), ("second", 200)]);

    let result = ConditionalWriter::new(&store)
        .rename_if_absent_at_target(old.id, "B", true)
        .unwrap();
    let RenameResult::Renamed(moved) = result else {
        panic!("rename should succeed");
    };

    assert_ne!(moved.id, old.id);
    assert!(store.get(&book_key(old.id)).unwrap().is_none());
    assert!(store.get(&book_name_key("A")).unwrap().is_none());
    assert!(greetings_of(&store, old.id).is_empty());

    let mut copied = greetings_of(&store, moved.id)
        .into_iter()
        .map(|greeting| (greeting.content, greeting.timestamp))
        .collect::<Vec<_>>();
    copied.sort();
    assert_eq!(
        copied,
        vec![("first".to_string(), 100), ("second".to_string(), 200)]
    );
}

#[test]
fn rename_to_taken_name_changes_nothing() {
    let store = MemoryEntityStore::new();
    let a = seed_book(&store, "A", &[("kept", 1)]);
    seed_book(&store, "B", &[]);
    let before = store.commit_sequence();

    for copy_children in [false, true] {
        let result = ConditionalWriter::new(&store)
            .rename_if_absent_at_target(a.id, "B", copy_children)
            .unwrap();
        assert_eq!(result, RenameResult::TargetTaken(a.clone()));
    }
    let result = ConditionalWriter::new(&store)
        .rename_if_absent_at_target(a.id, "A", false)
        .unwrap();
    assert!(!result.is_renamed());

    assert_eq!(store.commit_sequence(), before);
    assert_eq!(greetings_of(&store, a.id).len(), 1);
}

#[test]
fn rename_of_missing_book_reports_missing() {
    let store = MemoryEntityStore::new();
    let result = ConditionalWriter::new(&store)
        .rename_if_absent_at_target(99, "B", false)
        .unwrap();
    assert_eq!(result, RenameResult::BookMissing);
}

#[test]
fn copy_children_rename_beyond_group_limit_is_atomic() {
    let store = MemoryEntityStore::with_config(StoreConfig::default().with_max_groups(9));
    let greetings = (0..3)
        .map(|index| ("entry", index))
        .collect::<Vec<_>>();
    let old = seed_book(&store, "A", &greetings);
    let before = store.len();

    let err = ConditionalWriter::new(&store)
        .rename_if_absent_at_target(old.id, "B", true)
        .unwrap_err();
    assert!(matches!(err, StoreError::TooManyGroups { limit: 9, .. }));

    assert_eq!(store.len(), before);
    assert!(store.get(&book_key(old.id)).unwrap().is_some());
    assert!(store.get(&book_name_key("B")).unwrap().is_none());
    assert_eq!(greetings_of(&store, old.id).len(), 3);
}
