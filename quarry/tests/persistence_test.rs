//! End-to-end persistence behavior against the scripted driver: cascade
//! planning, insert ordering, generated-key writeback, optimistic locking,
//! junction maintenance and delete-date transitions.

mod common;

use std::sync::Arc;

use quarry::driver::{Driver, RunnerMode};
use quarry::entity::{entity_ref, snapshot, EntityInstance, PropValue};
use quarry::persist::PersistExecutor;
use quarry::testing::{row, StatementKind};
use quarry::{Dialect, QuarryError, Value};

fn kinds(statements: &[quarry::testing::ExecutedStatement]) -> Vec<StatementKind> {
    statements.iter().map(|s| s.kind).collect()
}

#[tokio::test]
async fn insert_writes_generated_key_and_bookkeeping_back() {
    let (manager, driver) = common::manager(Dialect::Sqlite);
    let user_id = manager.registry().id_of("User").unwrap();

    let mut user = EntityInstance::new(user_id);
    user.set("name", Value::from("ann"));
    user.set("email", Value::from("ann@example.com"));
    let user = entity_ref(user);

    driver.push_returning(vec![row(vec![("id", Value::from(1))])]);
    manager.save(std::slice::from_ref(&user)).await.unwrap();

    let statements = driver.executed();
    assert_eq!(
        kinds(&statements),
        vec![
            StatementKind::StartTransaction,
            StatementKind::Execute,
            StatementKind::Commit,
        ]
    );
    assert_eq!(
        statements[1].sql,
        "INSERT INTO \"users\" (\"created_at\", \"email\", \"name\", \"updated_at\", \"version\") \
         VALUES (?, ?, ?, ?, ?) RETURNING \"id\", \"created_at\", \"updated_at\", \"version\""
    );

    let saved = snapshot(&user);
    assert_eq!(saved.scalar("id"), Value::from(1));
    assert_eq!(saved.scalar("version"), Value::from(1));
    assert!(matches!(saved.scalar("createdAt"), Value::DateTime(_)));
    assert!(matches!(saved.scalar("updatedAt"), Value::DateTime(_)));
}

#[tokio::test]
async fn cascaded_child_inserts_after_its_parent_with_the_generated_key() {
    let (manager, driver) = common::manager(Dialect::Sqlite);
    let user_id = manager.registry().id_of("User").unwrap();
    let photo_id = manager.registry().id_of("Photo").unwrap();

    let mut user = EntityInstance::new(user_id);
    user.set("name", Value::from("ann"));
    let user = entity_ref(user);

    let mut photo = EntityInstance::new(photo_id);
    photo.set("url", Value::from("p.jpg"));
    photo.set("owner", PropValue::one(user.clone()));
    let photo = entity_ref(photo);
    user.write()
        .unwrap()
        .set("photos", PropValue::many(vec![photo.clone()]));

    driver.push_returning(vec![row(vec![("id", Value::from(1))])]);
    driver.push_returning(vec![row(vec![("id", Value::from(10))])]);
    manager.save(std::slice::from_ref(&user)).await.unwrap();

    let executes = driver.executed_of(StatementKind::Execute);
    assert_eq!(executes.len(), 2);
    assert!(executes[0].sql.starts_with("INSERT INTO \"users\""));
    assert_eq!(
        executes[1].sql,
        "INSERT INTO \"photos\" (\"owner_id\", \"url\") VALUES (?, ?) RETURNING \"id\""
    );
    // The parent's generated key flows into the child's foreign key slot.
    assert_eq!(executes[1].params, vec![Value::from(1), Value::from("p.jpg")]);
    assert_eq!(snapshot(&photo).scalar("id"), Value::from(10));
}

#[tokio::test]
async fn save_of_an_existing_row_diffs_and_bumps_the_version() {
    let (manager, driver) = common::manager(Dialect::Sqlite);
    let user_id = manager.registry().id_of("User").unwrap();

    let mut user = EntityInstance::new(user_id);
    user.set("id", Value::from(3));
    user.set("name", Value::from("new name"));
    user.set("email", Value::from("e@x"));
    let user = entity_ref(user);

    // Database copy loaded during planning.
    driver.push_query_result(vec![row(vec![
        ("subject_id", Value::from(3)),
        ("subject_name", Value::from("old name")),
        ("subject_email", Value::from("e@x")),
        ("subject_version", Value::from(3)),
    ])]);
    driver.push_affected(1);
    manager.save(std::slice::from_ref(&user)).await.unwrap();

    let statements = driver.executed();
    assert_eq!(
        kinds(&statements),
        vec![
            StatementKind::StartTransaction,
            StatementKind::Query,
            StatementKind::Execute,
            StatementKind::Commit,
        ]
    );
    let update = &statements[2];
    // Only the changed column is written; email stayed equal.
    assert!(update.sql.contains("SET \"name\" = ?"));
    assert!(!update.sql.contains("\"email\" = ?"));
    assert!(update.sql.contains("\"users\".\"version\" = ?"));
    assert_eq!(update.params[0], Value::from("new name"));
    // name, updated_at, version=4, then WHERE version=3 and id=3.
    assert_eq!(update.params[2], Value::from(4));
    assert_eq!(update.params[3], Value::from(3));
    assert_eq!(update.params[4], Value::from(3));

    let saved = snapshot(&user);
    assert_eq!(saved.scalar("version"), Value::from(4));
    assert!(matches!(saved.scalar("updatedAt"), Value::DateTime(_)));
}

#[tokio::test]
async fn stale_version_fails_with_optimistic_lock_and_rolls_back() {
    let (manager, driver) = common::manager(Dialect::Sqlite);
    let user_id = manager.registry().id_of("User").unwrap();

    let mut user = EntityInstance::new(user_id);
    user.set("id", Value::from(3));
    user.set("name", Value::from("new name"));
    let user = entity_ref(user);

    driver.push_query_result(vec![row(vec![
        ("subject_id", Value::from(3)),
        ("subject_name", Value::from("old name")),
        ("subject_version", Value::from(3)),
    ])]);
    driver.push_affected(0);

    let err = manager.save(std::slice::from_ref(&user)).await.unwrap_err();
    match err {
        QuarryError::OptimisticLock { entity, expected } => {
            assert_eq!(entity, "User");
            assert_eq!(expected, 3);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(driver.executed_of(StatementKind::Rollback).len(), 1);
    assert!(driver.executed_of(StatementKind::Commit).is_empty());
}

#[tokio::test]
async fn remove_deletes_cascaded_children_before_their_parent() {
    let (manager, driver) = common::manager(Dialect::Sqlite);
    let user_id = manager.registry().id_of("User").unwrap();
    let photo_id = manager.registry().id_of("Photo").unwrap();

    let mut user = EntityInstance::new(user_id);
    user.set("id", Value::from(1));
    let user = entity_ref(user);
    let mut photo = EntityInstance::new(photo_id);
    photo.set("id", Value::from(5));
    let photo = entity_ref(photo);
    user.write()
        .unwrap()
        .set("photos", PropValue::many(vec![photo]));

    manager.remove(std::slice::from_ref(&user)).await.unwrap();

    let executes = driver.executed_of(StatementKind::Execute);
    assert_eq!(executes.len(), 2);
    assert!(executes[0].sql.starts_with("DELETE FROM \"photos\""));
    assert_eq!(executes[0].params, vec![Value::from(5)]);
    assert!(executes[1].sql.starts_with("DELETE FROM \"users\""));
    assert_eq!(executes[1].params, vec![Value::from(1)]);
}

#[tokio::test]
async fn soft_remove_and_recover_transition_the_delete_date() {
    let (manager, driver) = common::manager(Dialect::Sqlite);
    let user_id = manager.registry().id_of("User").unwrap();

    let mut user = EntityInstance::new(user_id);
    user.set("id", Value::from(2));
    let user = entity_ref(user);

    manager.soft_remove(std::slice::from_ref(&user)).await.unwrap();
    let soft = driver.executed_of(StatementKind::Execute);
    assert!(soft[0]
        .sql
        .starts_with("UPDATE \"users\" SET \"deleted_at\" = ?, \"updated_at\" = ?"));
    assert!(matches!(soft[0].params[0], Value::DateTime(_)));
    assert!(matches!(snapshot(&user).scalar("deletedAt"), Value::DateTime(_)));

    driver.clear_log();
    manager.recover(std::slice::from_ref(&user)).await.unwrap();
    let recover = driver.executed_of(StatementKind::Execute);
    assert_eq!(recover[0].params[0], Value::Null);
    assert_eq!(snapshot(&user).scalar("deletedAt"), Value::Null);
}

#[tokio::test]
async fn save_soft_removes_when_the_delete_date_is_set() {
    let (manager, driver) = common::manager(Dialect::Sqlite);
    let user_id = manager.registry().id_of("User").unwrap();
    let stamp = chrono::DateTime::parse_from_rfc3339("2024-05-01T00:00:00+00:00").unwrap();

    let mut user = EntityInstance::new(user_id);
    user.set("id", Value::from(4));
    user.set("deletedAt", Value::DateTime(stamp));
    let user = entity_ref(user);

    // Loaded copy is live; writing the delete date makes this a soft
    // removal, not a column update.
    driver.push_query_result(vec![row(vec![
        ("subject_id", Value::from(4)),
        ("subject_deleted_at", Value::Null),
        ("subject_version", Value::from(3)),
    ])]);
    manager.save(std::slice::from_ref(&user)).await.unwrap();

    let executes = driver.executed_of(StatementKind::Execute);
    assert_eq!(executes.len(), 1);
    assert!(executes[0]
        .sql
        .starts_with("UPDATE \"users\" SET \"deleted_at\" = ?, \"updated_at\" = ?"));
    assert_eq!(executes[0].params[0], Value::DateTime(stamp));
    assert_eq!(*executes[0].params.last().unwrap(), Value::from(4));
    assert_eq!(snapshot(&user).scalar("deletedAt"), Value::DateTime(stamp));
}

#[tokio::test]
async fn save_recovers_when_the_delete_date_is_cleared() {
    let (manager, driver) = common::manager(Dialect::Sqlite);
    let user_id = manager.registry().id_of("User").unwrap();
    let stamp = chrono::DateTime::parse_from_rfc3339("2024-05-01T00:00:00+00:00").unwrap();

    let mut user = EntityInstance::new(user_id);
    user.set("id", Value::from(9));
    user.set("deletedAt", Value::Null);
    let user = entity_ref(user);

    driver.push_query_result(vec![row(vec![
        ("subject_id", Value::from(9)),
        ("subject_deleted_at", Value::DateTime(stamp)),
        ("subject_version", Value::from(1)),
    ])]);
    manager.save(std::slice::from_ref(&user)).await.unwrap();

    let executes = driver.executed_of(StatementKind::Execute);
    assert_eq!(executes.len(), 1);
    assert!(executes[0].sql.starts_with("UPDATE \"users\" SET \"deleted_at\" = ?"));
    assert_eq!(executes[0].params[0], Value::Null);
    assert_eq!(snapshot(&user).scalar("deletedAt"), Value::Null);
}

#[tokio::test]
async fn removing_without_an_identifier_is_an_error() {
    let (manager, _driver) = common::manager(Dialect::Sqlite);
    let user_id = manager.registry().id_of("User").unwrap();
    let user = entity_ref(EntityInstance::new(user_id));

    let err = manager.remove(std::slice::from_ref(&user)).await.unwrap_err();
    assert!(matches!(err, QuarryError::MissingIdentifier { .. }));
}

#[tokio::test]
async fn new_many_to_many_links_insert_junction_rows_after_the_row() {
    let (manager, driver) = common::manager(Dialect::Sqlite);
    let post_id = manager.registry().id_of("Post").unwrap();
    let category_id = manager.registry().id_of("Category").unwrap();

    let mut category = EntityInstance::new(category_id);
    category.set("id", Value::from(5));
    category.set("name", Value::from("tech"));
    let category = entity_ref(category);

    let mut post = EntityInstance::new(post_id);
    post.set("title", Value::from("hello"));
    post.set("categories", PropValue::many(vec![category]));
    let post = entity_ref(post);

    // The existing category loads during planning and stays unchanged.
    driver.push_query_result(vec![row(vec![
        ("subject_id", Value::from(5)),
        ("subject_name", Value::from("tech")),
    ])]);
    driver.push_returning(vec![row(vec![("id", Value::from(7))])]);
    manager.save(std::slice::from_ref(&post)).await.unwrap();

    let executes = driver.executed_of(StatementKind::Execute);
    assert_eq!(executes.len(), 2);
    assert_eq!(
        executes[0].sql,
        "INSERT INTO \"posts\" (\"title\") VALUES (?) RETURNING \"id\""
    );
    assert_eq!(
        executes[1].sql,
        "INSERT INTO \"post_categories\" (\"posts_id\", \"categories_id\") VALUES (?, ?)"
    );
    // Junction keys resolve after the generated key writeback.
    assert_eq!(executes[1].params, vec![Value::from(7), Value::from(5)]);
}

#[tokio::test]
async fn hard_remove_clears_junction_rows_first() {
    let (manager, driver) = common::manager(Dialect::Sqlite);
    let post_id = manager.registry().id_of("Post").unwrap();

    let mut post = EntityInstance::new(post_id);
    post.set("id", Value::from(7));
    let post = entity_ref(post);

    manager.remove(std::slice::from_ref(&post)).await.unwrap();

    let executes = driver.executed_of(StatementKind::Execute);
    assert_eq!(executes.len(), 2);
    assert_eq!(
        executes[0].sql,
        "DELETE FROM \"post_categories\" WHERE \"post_categories\".\"posts_id\" = ?"
    );
    assert_eq!(executes[0].params, vec![Value::from(7)]);
    assert!(executes[1].sql.starts_with("DELETE FROM \"posts\""));
}

#[tokio::test]
async fn save_joins_an_already_active_transaction() {
    let (manager, driver) = common::manager(Dialect::Sqlite);
    let user_id = manager.registry().id_of("User").unwrap();

    let mut user = EntityInstance::new(user_id);
    user.set("name", Value::from("ann"));
    let user = entity_ref(user);

    let executor = PersistExecutor::new(
        manager.registry().clone(),
        Arc::new(driver.clone()) as Arc<dyn Driver>,
    );
    let mut runner = driver.create_query_runner(RunnerMode::Master).await.unwrap();
    runner.start_transaction().await.unwrap();

    driver.push_returning(vec![row(vec![("id", Value::from(1))])]);
    executor
        .save(runner.as_mut(), std::slice::from_ref(&user))
        .await
        .unwrap();

    // No nested BEGIN and no premature COMMIT.
    assert_eq!(driver.executed_of(StatementKind::StartTransaction).len(), 1);
    assert!(driver.executed_of(StatementKind::Commit).is_empty());

    runner.commit_transaction().await.unwrap();
    assert_eq!(driver.executed_of(StatementKind::Commit).len(), 1);
}
