//! Hydration of flat joined rows into entity graphs, driven through the
//! manager so the aliasing scheme is exercised end to end.

mod common;

use quarry::entity::snapshot;
use quarry::hydration::to_document;
use quarry::manager::FindOptions;
use quarry::testing::row;
use quarry::{Dialect, Value};

#[tokio::test]
async fn joined_rows_collapse_into_roots_with_collections() {
    let (manager, driver) = common::manager(Dialect::Sqlite);

    driver.push_query_result(vec![
        row(vec![
            ("User_id", Value::from(1)),
            ("User_name", Value::from("ann")),
            ("User_posts_id", Value::from(11)),
            ("User_posts_title", Value::from("first")),
        ]),
        row(vec![
            ("User_id", Value::from(1)),
            ("User_name", Value::from("ann")),
            ("User_posts_id", Value::from(12)),
            ("User_posts_title", Value::from("second")),
        ]),
        // Unmatched LEFT JOIN slot: the root survives, the null child drops.
        row(vec![
            ("User_id", Value::from(2)),
            ("User_name", Value::from("bo")),
            ("User_posts_id", Value::Null),
            ("User_posts_title", Value::Null),
        ]),
    ]);

    let users = manager
        .find("User", FindOptions::default().relation("posts"))
        .await
        .unwrap();
    assert_eq!(users.len(), 2);

    let ann = snapshot(&users[0]);
    assert_eq!(ann.scalar("name"), Value::from("ann"));
    let posts = ann.relation_many("posts");
    assert_eq!(posts.len(), 2);
    assert_eq!(snapshot(&posts[0]).scalar("title"), Value::from("first"));
    assert_eq!(snapshot(&posts[1]).scalar("title"), Value::from("second"));

    let bo = snapshot(&users[1]);
    assert!(bo.relation_many("posts").is_empty());
}

#[tokio::test]
async fn nested_relation_paths_hydrate_transitively() {
    let (manager, driver) = common::manager(Dialect::Sqlite);

    driver.push_query_result(vec![row(vec![
        ("User_id", Value::from(1)),
        ("User_name", Value::from("ann")),
        ("User_posts_id", Value::from(11)),
        ("User_posts_title", Value::from("first")),
        ("User_posts_categories_id", Value::from(4)),
        ("User_posts_categories_name", Value::from("tech")),
    ])]);

    let users = manager
        .find("User", FindOptions::default().relation("posts.categories"))
        .await
        .unwrap();
    let posts = snapshot(&users[0]).relation_many("posts");
    let categories = snapshot(&posts[0]).relation_many("categories");
    assert_eq!(snapshot(&categories[0]).scalar("name"), Value::from("tech"));
}

#[tokio::test]
async fn discriminator_value_dispatches_to_the_child_metadata() {
    let (manager, driver) = common::manager(Dialect::Sqlite);
    let article_id = manager.registry().id_of("Article").unwrap();
    let content_id = manager.registry().id_of("Content").unwrap();

    driver.push_query_result(vec![
        row(vec![
            ("Content_id", Value::from(1)),
            ("Content_kind", Value::from("article")),
            ("Content_title", Value::from("deep dive")),
            ("Content_body", Value::from("all of it")),
        ]),
        row(vec![
            ("Content_id", Value::from(2)),
            ("Content_kind", Value::from("content")),
            ("Content_title", Value::from("plain")),
            ("Content_body", Value::Null),
        ]),
    ]);

    let contents = manager.find("Content", FindOptions::default()).await.unwrap();
    assert_eq!(contents.len(), 2);

    let article = snapshot(&contents[0]);
    assert_eq!(article.entity, article_id);
    assert_eq!(article.scalar("body"), Value::from("all of it"));

    let plain = snapshot(&contents[1]);
    assert_eq!(plain.entity, content_id);
    assert_eq!(plain.scalar("title"), Value::from("plain"));
}

#[tokio::test]
async fn to_document_serializes_the_loaded_graph() {
    let (manager, driver) = common::manager(Dialect::Sqlite);

    driver.push_query_result(vec![row(vec![
        ("User_id", Value::from(1)),
        ("User_name", Value::from("ann")),
        ("User_posts_id", Value::from(11)),
        ("User_posts_title", Value::from("first")),
    ])]);

    let users = manager
        .find("User", FindOptions::default().relation("posts"))
        .await
        .unwrap();
    let doc = to_document(manager.registry(), &users[0]);
    assert_eq!(doc["name"], serde_json::json!("ann"));
    assert_eq!(doc["posts"][0]["title"], serde_json::json!("first"));
}
