//! Entity-manager facade: find-options translation, implicit criteria
//! joins, identifier lookups, counting and the transaction helper.

mod common;

use quarry::criteria::Criterion;
use quarry::driver::QueryRunner;
use quarry::entity::snapshot;
use quarry::manager::FindOptions;
use quarry::query::OrderDirection;
use quarry::testing::{row, StatementKind};
use quarry::{ops, Dialect, QuarryError, Value};

#[test]
fn nested_criteria_on_a_relation_adds_an_implicit_join() {
    let (manager, _driver) = common::manager(Dialect::Sqlite);
    let options = FindOptions::default().criteria(Criterion::nested(vec![(
        "author",
        Criterion::nested(vec![("name", Criterion::value("ann"))]),
    )]));

    let (sql, params) = manager
        .build_find("Post", &options)
        .unwrap()
        .get_query_and_parameters(Dialect::Sqlite)
        .unwrap();
    assert!(sql.contains("LEFT JOIN \"users\" \"Post_author\""));
    assert!(sql.contains("\"Post_author\".\"name\" = ?"));
    assert_eq!(params, vec![Value::from("ann")]);
}

#[test]
fn scalar_criteria_on_a_relation_compares_the_target_key() {
    let (manager, _driver) = common::manager(Dialect::Sqlite);
    let options = FindOptions::default().criteria(Criterion::nested(vec![(
        "author",
        Criterion::value(9),
    )]));

    let (sql, params) = manager
        .build_find("Post", &options)
        .unwrap()
        .get_query_and_parameters(Dialect::Sqlite)
        .unwrap();
    assert!(sql.contains("\"Post_author\".\"id\" = ?"));
    assert_eq!(params, vec![Value::from(9)]);
}

#[test]
fn criteria_operators_flow_through_to_rendering() {
    let (manager, _driver) = common::manager(Dialect::Sqlite);
    let options = FindOptions::default().criteria(Criterion::nested(vec![
        ("title", Criterion::op(ops::like("%rust%"))),
        ("published", Criterion::value(true)),
    ]));

    let (sql, params) = manager
        .build_find("Post", &options)
        .unwrap()
        .get_query_and_parameters(Dialect::Sqlite)
        .unwrap();
    assert!(sql.contains("\"Post\".\"published\" = ?"));
    assert!(sql.contains("\"Post\".\"title\" LIKE ?"));
    assert_eq!(params, vec![Value::from(true), Value::from("%rust%")]);
}

#[test]
fn unknown_criteria_column_is_a_typed_error() {
    let (manager, _driver) = common::manager(Dialect::Sqlite);
    let options = FindOptions::default()
        .criteria(Criterion::nested(vec![("bogus", Criterion::value(1))]));

    let err = manager.build_find("Post", &options).unwrap_err();
    match err {
        QuarryError::ColumnNotFound { entity, property } => {
            assert_eq!(entity, "Post");
            assert_eq!(property, "bogus");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn unknown_relation_paths_are_collected_and_reported_together() {
    let (manager, _driver) = common::manager(Dialect::Sqlite);
    let options = FindOptions::default()
        .relation("posts")
        .relation("nope")
        .relation("alsoNope");

    let err = manager.build_find("User", &options).unwrap_err();
    match err {
        QuarryError::RelationsNotFound { entity, paths } => {
            assert_eq!(entity, "User");
            assert_eq!(paths, vec!["nope".to_string(), "alsoNope".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn dotted_order_paths_resolve_through_relation_aliases() {
    let (manager, _driver) = common::manager(Dialect::Sqlite);
    let options = FindOptions::default()
        .relation("posts")
        .order_by("posts.title", OrderDirection::Asc)
        .order_by("name", OrderDirection::Desc);

    let sql = manager
        .build_find("User", &options)
        .unwrap()
        .get_sql(Dialect::Sqlite)
        .unwrap();
    assert!(sql.contains("ORDER BY \"User_posts\".\"title\" ASC, \"User\".\"name\" DESC"));
}

#[tokio::test]
async fn count_runs_a_distinct_count_over_the_root_key() {
    let (manager, driver) = common::manager(Dialect::Sqlite);
    driver.push_query_result(vec![row(vec![("cnt", Value::from(3))])]);

    let count = manager.count("User", FindOptions::default()).await.unwrap();
    assert_eq!(count, 3);

    let queries = driver.executed_of(StatementKind::Query);
    assert!(queries[0]
        .sql
        .starts_with("SELECT COUNT(DISTINCT \"User\".\"id\") AS \"cnt\" FROM \"users\" \"User\""));
}

#[tokio::test]
async fn find_by_id_wraps_the_identifier_lookup() {
    let (manager, driver) = common::manager(Dialect::Sqlite);
    driver.push_query_result(vec![row(vec![
        ("User_id", Value::from(9)),
        ("User_name", Value::from("ann")),
    ])]);

    let found = manager.find_by_id("User", 9).await.unwrap().unwrap();
    assert_eq!(snapshot(&found).scalar("name"), Value::from("ann"));

    let queries = driver.executed_of(StatementKind::Query);
    assert!(queries[0].sql.contains("\"User\".\"id\" = ?"));
    assert_eq!(queries[0].params, vec![Value::from(9)]);
}

#[tokio::test]
async fn find_by_id_rejects_composite_keys() {
    let (manager, _driver) = common::manager(Dialect::Sqlite);
    let err = manager.find_by_id("ExternalPost", 1).await.unwrap_err();
    assert!(matches!(err, QuarryError::QueryValidation { .. }));
}

#[tokio::test]
async fn find_one_without_relations_limits_to_a_single_row() {
    let (manager, driver) = common::manager(Dialect::Sqlite);
    driver.push_query_result(Vec::new());

    let found = manager.find_one("User", FindOptions::default()).await.unwrap();
    assert!(found.is_none());

    let queries = driver.executed_of(StatementKind::Query);
    assert!(queries[0].sql.ends_with(" LIMIT 1"));
}

#[tokio::test]
async fn transaction_commits_on_success_and_rolls_back_on_error() {
    let (manager, driver) = common::manager(Dialect::Sqlite);

    let value = manager
        .transaction(|runner| {
            Box::pin(async move {
                runner.query("SELECT 1", &[]).await?;
                Ok(5)
            })
        })
        .await
        .unwrap();
    assert_eq!(value, 5);
    assert_eq!(driver.executed_of(StatementKind::Commit).len(), 1);

    driver.clear_log();
    let err = manager
        .transaction(|_runner| {
            Box::pin(async move { Err::<(), _>(QuarryError::driver("boom")) })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, QuarryError::Driver { .. }));
    assert_eq!(driver.executed_of(StatementKind::Rollback).len(), 1);
    assert!(driver.executed_of(StatementKind::Commit).is_empty());
}

#[tokio::test]
async fn repository_scopes_operations_to_one_entity() {
    let (manager, driver) = common::manager(Dialect::Sqlite);
    assert!(manager.repository("Nope").is_err());

    let users = manager.repository("User").unwrap();
    driver.push_query_result(vec![row(vec![
        ("User_id", Value::from(1)),
        ("User_name", Value::from("ann")),
    ])]);
    let found = users.find(FindOptions::default()).await.unwrap();
    assert_eq!(found.len(), 1);
}
