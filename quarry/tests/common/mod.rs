//! Shared fixture schema for the integration tests: a small blog domain
//! exercising generated keys, special columns, every relation kind, a
//! composite primary key and single-table inheritance.

#![allow(dead_code)]

use std::sync::Arc;

use quarry::metadata::{ColumnSchema, EntitySchema, MetadataRegistry, RelationSchema};
use quarry::testing::ScriptedDriver;
use quarry::{Dialect, EntityManager};

pub fn registry() -> Arc<MetadataRegistry> {
    Arc::new(
        MetadataRegistry::build(vec![
            user_schema(),
            post_schema(),
            category_schema(),
            photo_schema(),
            external_post_schema(),
            syndication_schema(),
            content_schema(),
            article_schema(),
        ])
        .expect("fixture schema must build"),
    )
}

pub fn manager(dialect: Dialect) -> (EntityManager, ScriptedDriver) {
    let _ = env_logger::try_init();
    let driver = ScriptedDriver::new(dialect);
    let manager = EntityManager::new(registry(), Arc::new(driver.clone()));
    (manager, driver)
}

fn user_schema() -> EntitySchema {
    EntitySchema::new("User", "users")
        .column(ColumnSchema::primary_generated("id"))
        .column(ColumnSchema::text("name"))
        .column(ColumnSchema::text("email"))
        .column(
            ColumnSchema::datetime("createdAt")
                .database_name("created_at")
                .create_date(),
        )
        .column(
            ColumnSchema::datetime("updatedAt")
                .database_name("updated_at")
                .update_date(),
        )
        .column(
            ColumnSchema::datetime("deletedAt")
                .database_name("deleted_at")
                .delete_date(),
        )
        .column(ColumnSchema::int("version").version())
        .relation(RelationSchema::one_to_many("posts", "Post", "author"))
        .relation(RelationSchema::one_to_many("photos", "Photo", "owner").cascade_all())
}

fn post_schema() -> EntitySchema {
    EntitySchema::new("Post", "posts")
        .column(ColumnSchema::primary_generated("id"))
        .column(ColumnSchema::text("title"))
        .column(ColumnSchema::bool("published"))
        .relation(
            RelationSchema::many_to_one("author", "User")
                .join_column("author_id", "id")
                .inverse("posts"),
        )
        .relation(
            RelationSchema::many_to_many("categories", "Category")
                .junction_table("post_categories")
                .inverse("posts")
                .cascade_insert(),
        )
}

fn category_schema() -> EntitySchema {
    EntitySchema::new("Category", "categories")
        .column(ColumnSchema::primary_generated("id"))
        .column(ColumnSchema::text("name"))
        .relation(RelationSchema::many_to_many("posts", "Post").inverse("categories"))
}

fn photo_schema() -> EntitySchema {
    EntitySchema::new("Photo", "photos")
        .column(ColumnSchema::primary_generated("id"))
        .column(ColumnSchema::text("url"))
        .relation(
            RelationSchema::many_to_one("owner", "User")
                .join_column("owner_id", "id")
                .inverse("photos"),
        )
}

fn external_post_schema() -> EntitySchema {
    EntitySchema::new("ExternalPost", "external_posts")
        .column(ColumnSchema::text("outlet").primary())
        .column(ColumnSchema::int("id").primary())
        .column(ColumnSchema::text("title"))
        .relation(RelationSchema::one_to_many(
            "syndications",
            "Syndication",
            "post",
        ))
}

fn syndication_schema() -> EntitySchema {
    EntitySchema::new("Syndication", "syndications")
        .column(ColumnSchema::primary_generated("id"))
        .column(ColumnSchema::text("feed"))
        .relation(
            RelationSchema::many_to_one("post", "ExternalPost")
                .join_column("post_outlet", "outlet")
                .join_column("post_id", "id")
                .inverse("syndications"),
        )
}

fn content_schema() -> EntitySchema {
    EntitySchema::new("Content", "contents")
        .column(ColumnSchema::primary_generated("id"))
        .column(ColumnSchema::text("kind"))
        .column(ColumnSchema::text("title"))
        .discriminator("kind", "content")
}

fn article_schema() -> EntitySchema {
    EntitySchema::new("Article", "contents")
        .column(ColumnSchema::text("body").nullable())
        .extends("Content", "article")
}
