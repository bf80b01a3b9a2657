//! SQL rendering of the select, insert, update and delete builders across
//! dialects, checked against the fixture schema.

mod common;

use std::collections::BTreeMap;

use quarry::query::{
    DeleteQueryBuilder, InsertQueryBuilder, OrderDirection, SelectQueryBuilder, UpdateQueryBuilder,
};
use quarry::{ops, Dialect, QuarryError, Value};

fn select(entity: &str, alias: &str) -> SelectQueryBuilder {
    SelectQueryBuilder::new(common::registry(), entity, alias).unwrap()
}

#[test]
fn select_expands_columns_and_filters_soft_deleted() {
    let sql = select("User", "user").get_sql(Dialect::Sqlite).unwrap();
    assert_eq!(
        sql,
        "SELECT \"user\".\"id\" AS \"user_id\", \"user\".\"name\" AS \"user_name\", \
         \"user\".\"email\" AS \"user_email\", \"user\".\"created_at\" AS \"user_created_at\", \
         \"user\".\"updated_at\" AS \"user_updated_at\", \"user\".\"deleted_at\" AS \"user_deleted_at\", \
         \"user\".\"version\" AS \"user_version\" \
         FROM \"users\" \"user\" WHERE \"user\".\"deleted_at\" IS NULL"
    );
}

#[test]
fn with_deleted_drops_the_soft_delete_filter() {
    let sql = select("User", "user")
        .with_deleted()
        .get_sql(Dialect::Sqlite)
        .unwrap();
    assert!(!sql.contains("deleted_at\" IS NULL"));
}

#[test]
fn where_op_binds_positional_parameters_per_dialect() {
    let builder = select("User", "user").where_op("name", ops::equal("alice"));

    let (sql, params) = builder.get_query_and_parameters(Dialect::Sqlite).unwrap();
    assert!(sql.contains("WHERE (\"user\".\"name\" = ?) AND \"user\".\"deleted_at\" IS NULL"));
    assert_eq!(params, vec![Value::from("alice")]);

    let (sql, _) = builder.get_query_and_parameters(Dialect::Postgres).unwrap();
    assert!(sql.contains("\"user\".\"name\" = $1"));
}

#[test]
fn equality_on_null_renders_is_null() {
    let (sql, params) = select("User", "user")
        .where_op("email", ops::equal(Value::Null))
        .get_query_and_parameters(Dialect::Sqlite)
        .unwrap();
    assert!(sql.contains("\"user\".\"email\" IS NULL"));
    assert!(params.is_empty());
}

#[test]
fn empty_in_lists_short_circuit() {
    let (sql, params) = select("User", "user")
        .where_op("id", ops::in_values(Vec::<i64>::new()))
        .get_query_and_parameters(Dialect::Sqlite)
        .unwrap();
    assert!(sql.contains("(1 = 0)"));
    assert!(params.is_empty());

    let (sql, _) = select("User", "user")
        .where_op("id", ops::not(ops::in_values(Vec::<i64>::new())))
        .get_query_and_parameters(Dialect::Sqlite)
        .unwrap();
    assert!(sql.contains("(1 = 1)"));
}

#[test]
fn where_in_ids_supports_composite_keys() {
    let mut first = BTreeMap::new();
    first.insert("outlet".to_string(), Value::from("wire"));
    first.insert("id".to_string(), Value::from(1));
    let mut second = BTreeMap::new();
    second.insert("outlet".to_string(), Value::from("blog"));
    second.insert("id".to_string(), Value::from(2));

    let (sql, params) = select("ExternalPost", "ep")
        .where_in_ids(vec![first, second])
        .get_query_and_parameters(Dialect::Sqlite)
        .unwrap();
    // Each group follows the primary-key declaration order: outlet, id.
    assert!(sql.contains(
        "((\"ep\".\"outlet\" = ? AND \"ep\".\"id\" = ?)) OR \
         ((\"ep\".\"outlet\" = ? AND \"ep\".\"id\" = ?))"
    ));
    assert_eq!(
        params,
        vec![
            Value::from("wire"),
            Value::from(1),
            Value::from("blog"),
            Value::from(2),
        ]
    );
}

#[test]
fn literal_zero_limit_and_offset_render() {
    let sql = select("Post", "post")
        .limit(0)
        .offset(0)
        .get_sql(Dialect::Sqlite)
        .unwrap();
    assert!(sql.ends_with(" LIMIT 0 OFFSET 0"));
}

#[test]
fn many_to_one_join_derives_on_clause_from_metadata() {
    let sql = select("Post", "post")
        .left_join_and_select("post.author", "author")
        .get_sql(Dialect::Sqlite)
        .unwrap();
    // The joined side carries its own soft-delete filter.
    assert!(sql.contains(
        "LEFT JOIN \"users\" \"author\" ON \"author\".\"id\" = \"post\".\"author_id\" \
         AND \"author\".\"deleted_at\" IS NULL"
    ));
    assert!(sql.contains("\"author\".\"name\" AS \"author_name\""));
}

#[test]
fn inverse_join_flips_the_on_clause() {
    let sql = select("User", "user")
        .left_join_and_select("user.posts", "post")
        .get_sql(Dialect::Sqlite)
        .unwrap();
    assert!(sql.contains("LEFT JOIN \"posts\" \"post\" ON \"post\".\"author_id\" = \"user\".\"id\""));
}

#[test]
fn many_to_many_join_goes_through_the_junction_table() {
    let sql = select("Post", "post")
        .left_join_and_select("post.categories", "category")
        .get_sql(Dialect::Sqlite)
        .unwrap();
    assert!(sql.contains(
        "LEFT JOIN \"post_categories\" \"category_junction\" \
         ON \"category_junction\".\"posts_id\" = \"post\".\"id\""
    ));
    assert!(sql.contains(
        "LEFT JOIN \"categories\" \"category\" \
         ON \"category\".\"id\" = \"category_junction\".\"categories_id\""
    ));
}

#[test]
fn unknown_join_paths_are_reported_together_at_render_time() {
    let err = select("Post", "post")
        .left_join("post.nope", "a")
        .left_join("post.also_nope", "b")
        .get_sql(Dialect::Sqlite)
        .unwrap_err();
    match err {
        QuarryError::RelationsNotFound { entity, paths } => {
            assert_eq!(entity, "Post");
            assert_eq!(paths, vec!["post.nope".to_string(), "post.also_nope".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn take_under_a_to_many_join_paginates_through_an_id_subquery() {
    let sql = select("Post", "post")
        .left_join_and_select("post.categories", "category")
        .take(2)
        .get_sql(Dialect::Sqlite)
        .unwrap();
    assert!(sql.contains(
        "WHERE \"post\".\"id\" IN (SELECT DISTINCT \"post\".\"id\" FROM \"posts\" \"post\""
    ));
    assert!(sql.contains("LIMIT 2)"));
    // The window lives inside the subquery, not on the outer statement.
    assert!(!sql.ends_with("LIMIT 2"));
}

#[test]
fn take_without_a_to_many_join_is_a_plain_limit() {
    let sql = select("User", "user")
        .take(2)
        .skip(4)
        .get_sql(Dialect::Sqlite)
        .unwrap();
    assert!(sql.ends_with(" LIMIT 2 OFFSET 4"));
    assert!(!sql.contains("SELECT DISTINCT"));
}

#[test]
fn take_with_a_composite_key_paginates_through_a_row_value_subquery() {
    let sql = select("ExternalPost", "ep")
        .left_join_and_select("ep.syndications", "s")
        .take(2)
        .get_sql(Dialect::Postgres)
        .unwrap();
    assert!(sql.contains(
        "(\"ep\".\"outlet\", \"ep\".\"id\") IN \
         (SELECT DISTINCT \"ep\".\"outlet\", \"ep\".\"id\" FROM \"external_posts\" \"ep\""
    ));
    assert!(sql.contains("LIMIT 2)"));
}

#[test]
fn take_with_a_composite_key_is_rejected_on_sqlite() {
    let err = select("ExternalPost", "ep")
        .left_join_and_select("ep.syndications", "s")
        .take(2)
        .get_sql(Dialect::Sqlite)
        .unwrap_err();
    assert!(matches!(err, QuarryError::QueryValidation { .. }));
}

#[test]
fn ilike_is_native_on_postgres_and_emulated_elsewhere() {
    let builder = select("User", "user").where_op("name", ops::ilike("%ann%"));

    let (pg, _) = builder.get_query_and_parameters(Dialect::Postgres).unwrap();
    assert!(pg.contains("\"user\".\"name\" ILIKE $1"));

    let (lite, params) = builder.get_query_and_parameters(Dialect::Sqlite).unwrap();
    assert!(lite.contains("LOWER(\"user\".\"name\") LIKE LOWER(?)"));
    assert_eq!(params, vec![Value::from("%ann%")]);
}

#[test]
fn array_operators_are_postgres_only() {
    let err = select("User", "user")
        .where_op("name", ops::array_contains(vec!["a"]))
        .get_query_and_parameters(Dialect::Sqlite)
        .unwrap_err();
    match err {
        QuarryError::UnsupportedOperator { operator, dialect } => {
            assert_eq!(operator, "array-contains");
            assert_eq!(dialect, "sqlite");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn any_renders_array_syntax_on_postgres_and_in_elsewhere() {
    let builder = select("User", "user").where_op("id", ops::any(vec![1, 2]));

    let (pg, _) = builder.get_query_and_parameters(Dialect::Postgres).unwrap();
    assert!(pg.contains("\"user\".\"id\" = ANY (ARRAY[$1, $2])"));

    let (lite, _) = builder.get_query_and_parameters(Dialect::Sqlite).unwrap();
    assert!(lite.contains("\"user\".\"id\" IN (?, ?)"));
}

#[test]
fn inheritance_root_filters_by_all_discriminator_values() {
    let (sql, params) = select("Content", "c")
        .get_query_and_parameters(Dialect::Sqlite)
        .unwrap();
    assert!(sql.contains("\"c\".\"kind\" IN (?, ?)"));
    assert_eq!(params, vec![Value::from("content"), Value::from("article")]);
    // Child-only columns share the table and join the select list.
    assert!(sql.contains("\"c\".\"body\" AS \"c_body\""));
}

#[test]
fn raw_where_binds_named_parameters() {
    let (sql, params) = select("User", "user")
        .where_raw("\"user\".\"name\" = :nm")
        .set_parameter("nm", "zed")
        .get_query_and_parameters(Dialect::Sqlite)
        .unwrap();
    assert!(sql.contains("(\"user\".\"name\" = ?)"));
    assert_eq!(params, vec![Value::from("zed")]);
}

#[test]
fn order_by_resolves_property_to_database_column() {
    let sql = select("User", "user")
        .order_by("createdAt", OrderDirection::Desc)
        .add_order_by("name", OrderDirection::Asc)
        .get_sql(Dialect::Sqlite)
        .unwrap();
    assert!(sql.contains(" ORDER BY \"user\".\"created_at\" DESC, \"user\".\"name\" ASC"));
}

// ---- insert ----

#[test]
fn insert_returns_generated_and_bookkeeping_columns_on_postgres() {
    let mut row = BTreeMap::new();
    row.insert("name".to_string(), Value::from("ann"));
    row.insert("email".to_string(), Value::from("ann@example.com"));

    let (sql, params) = InsertQueryBuilder::new(common::registry(), "User")
        .unwrap()
        .values(row)
        .get_query_and_parameters(Dialect::Postgres)
        .unwrap();
    assert_eq!(
        sql,
        "INSERT INTO \"users\" (\"email\", \"name\") VALUES ($1, $2) \
         RETURNING \"id\", \"created_at\", \"updated_at\", \"version\""
    );
    assert_eq!(params, vec![Value::from("ann@example.com"), Value::from("ann")]);
}

#[test]
fn insert_has_no_returning_on_mysql() {
    let mut row = BTreeMap::new();
    row.insert("name".to_string(), Value::from("ann"));

    let sql = InsertQueryBuilder::new(common::registry(), "User")
        .unwrap()
        .values(row)
        .get_sql(Dialect::MySql)
        .unwrap();
    assert_eq!(sql, "INSERT INTO `users` (`name`) VALUES (?)");
}

#[test]
fn batch_insert_pads_missing_slots() {
    let mut first = BTreeMap::new();
    first.insert("email".to_string(), Value::from("a@x"));
    first.insert("name".to_string(), Value::from("a"));
    let mut second = BTreeMap::new();
    second.insert("email".to_string(), Value::from("b@x"));

    let builder = InsertQueryBuilder::new(common::registry(), "User")
        .unwrap()
        .values_many(vec![first, second]);

    let lite = builder.get_sql(Dialect::Sqlite).unwrap();
    assert!(lite.contains("VALUES (?, ?), (?, NULL)"));

    let pg = builder.get_sql(Dialect::Postgres).unwrap();
    assert!(pg.contains("VALUES ($1, $2), ($3, DEFAULT)"));
}

#[test]
fn conflict_handling_follows_the_dialect_flavor() {
    let mut row = BTreeMap::new();
    row.insert("email".to_string(), Value::from("a@x"));
    row.insert("name".to_string(), Value::from("a"));

    let ignore = InsertQueryBuilder::new(common::registry(), "User")
        .unwrap()
        .values(row.clone())
        .or_ignore(vec!["email".to_string()]);
    assert!(ignore
        .get_sql(Dialect::Postgres)
        .unwrap()
        .contains(" ON CONFLICT (\"email\") DO NOTHING"));
    assert!(ignore
        .get_sql(Dialect::MySql)
        .unwrap()
        .starts_with("INSERT IGNORE INTO `users`"));

    let upsert = InsertQueryBuilder::new(common::registry(), "User")
        .unwrap()
        .values(row)
        .or_update(vec!["email".to_string()], vec!["name".to_string()]);
    assert!(upsert
        .get_sql(Dialect::Postgres)
        .unwrap()
        .contains(" ON CONFLICT (\"email\") DO UPDATE SET \"name\" = EXCLUDED.\"name\""));
    assert!(upsert
        .get_sql(Dialect::MySql)
        .unwrap()
        .contains(" ON DUPLICATE KEY UPDATE `name` = VALUES(`name`)"));
}

#[test]
fn insert_without_rows_is_rejected() {
    let err = InsertQueryBuilder::new(common::registry(), "User")
        .unwrap()
        .get_sql(Dialect::Sqlite)
        .unwrap_err();
    assert!(matches!(err, QuarryError::QueryValidation { .. }));
}

// ---- update ----

#[test]
fn update_qualifies_conditions_with_the_table_name() {
    let (sql, params) = UpdateQueryBuilder::new(common::registry(), "User")
        .unwrap()
        .set("name", "bob")
        .where_op("id", ops::equal(7))
        .get_query_and_parameters(Dialect::Sqlite)
        .unwrap();
    assert_eq!(
        sql,
        "UPDATE \"users\" SET \"name\" = ? WHERE \"users\".\"id\" = ?"
    );
    assert_eq!(params, vec![Value::from("bob"), Value::from(7)]);
}

#[test]
fn update_supports_raw_set_fragments() {
    let sql = UpdateQueryBuilder::new(common::registry(), "User")
        .unwrap()
        .set_raw("\"version\" = \"version\" + 1")
        .where_op("id", ops::equal(1))
        .get_sql(Dialect::Sqlite)
        .unwrap();
    assert!(sql.contains("SET \"version\" = \"version\" + 1 WHERE"));
}

#[test]
fn update_without_sets_is_rejected() {
    let err = UpdateQueryBuilder::new(common::registry(), "User")
        .unwrap()
        .where_op("id", ops::equal(1))
        .get_sql(Dialect::Sqlite)
        .unwrap_err();
    assert!(matches!(err, QuarryError::QueryValidation { .. }));
}

// ---- delete ----

#[test]
fn delete_requires_a_where_condition() {
    let err = DeleteQueryBuilder::new(common::registry(), "User")
        .unwrap()
        .get_sql(Dialect::Sqlite)
        .unwrap_err();
    assert!(matches!(err, QuarryError::QueryValidation { .. }));
}

#[test]
fn delete_renders_against_the_entity_table() {
    let (sql, params) = DeleteQueryBuilder::new(common::registry(), "User")
        .unwrap()
        .where_op("id", ops::equal(3))
        .get_query_and_parameters(Dialect::Sqlite)
        .unwrap();
    assert_eq!(sql, "DELETE FROM \"users\" WHERE \"users\".\"id\" = ?");
    assert_eq!(params, vec![Value::from(3)]);
}

#[test]
fn raw_table_delete_targets_junction_rows() {
    let (sql, params) = DeleteQueryBuilder::from_table(common::registry(), "post_categories")
        .where_op("posts_id", ops::equal(1))
        .and_where_op("categories_id", ops::equal(2))
        .get_query_and_parameters(Dialect::Sqlite)
        .unwrap();
    assert_eq!(
        sql,
        "DELETE FROM \"post_categories\" WHERE \"post_categories\".\"posts_id\" = ? \
         AND \"post_categories\".\"categories_id\" = ?"
    );
    assert_eq!(params, vec![Value::from(1), Value::from(2)]);
}
