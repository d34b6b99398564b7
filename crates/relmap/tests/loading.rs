//! Fetching nested entity graphs.

mod common;

use asupersync::runtime::RuntimeBuilder;
use common::*;
use relmap::prelude::*;

fn user_rows(conn: &MockConnection) {
    conn.push_rows(
        &["id", "name"],
        vec![
            vec![Value::BigInt(1), Value::from("Ann")],
            vec![Value::BigInt(2), Value::from("Bob")],
        ],
    );
}

fn titles(user: &EntityRef) -> Vec<Value> {
    user.related_many("posts")
        .unwrap()
        .iter()
        .filter_map(|p| p.get("title"))
        .collect()
}

#[test]
fn test_inload_deduplicates_joined_parent_rows() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let orm = blog_orm(&conn);
    let mut map = orm.entity_map();

    let post_row = |user: i64, name: &str, post: Option<(i64, &str)>| match post {
        Some((id, title)) => vec![
            Value::BigInt(user),
            Value::from(name),
            Value::BigInt(id),
            Value::from(title),
            Value::BigInt(user),
        ],
        None => vec![
            Value::BigInt(user),
            Value::from(name),
            Value::Null,
            Value::Null,
            Value::Null,
        ],
    };
    conn.push_rows(
        &["id", "name", "id", "title", "user_id"],
        vec![
            post_row(1, "Ann", Some((10, "a"))),
            post_row(1, "Ann", Some((11, "b"))),
            post_row(1, "Ann", Some((12, "c"))),
            post_row(2, "Bob", None),
        ],
    );

    let users = unwrap_outcome(rt.block_on(
        orm.select("user")
            .unwrap()
            .load("posts", LoadMethod::Inload)
            .order_by("id", true)
            .fetch_all(&cx, &mut map),
    ));

    let queries = conn.queries();
    assert_eq!(queries.len(), 1);
    assert_eq!(
        queries[0].0,
        concat!(
            r#"SELECT "user"."id", "user"."name", "user_posts"."id", "user_posts"."title", "user_posts"."user_id" "#,
            r#"FROM "users" AS "user" LEFT JOIN "posts" AS "user_posts" ON "user_posts"."user_id" = "user"."id" "#,
            r#"ORDER BY "user"."id" ASC"#
        )
    );
    assert_eq!(users.len(), 2);
    assert_eq!(
        titles(&users[0]),
        vec![Value::from("a"), Value::from("b"), Value::from("c")]
    );
    assert!(users[1].is_relation_loaded("posts").unwrap());
    assert!(users[1].related_many("posts").unwrap().is_empty());
}

#[test]
fn test_postload_yields_the_same_graph_with_one_query_per_level() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let orm = blog_orm(&conn);
    let mut map = orm.entity_map();

    user_rows(&conn);
    conn.push_rows(
        &["id", "title", "user_id"],
        vec![
            vec![Value::BigInt(10), Value::from("a"), Value::BigInt(1)],
            vec![Value::BigInt(11), Value::from("b"), Value::BigInt(1)],
            vec![Value::BigInt(12), Value::from("c"), Value::BigInt(1)],
        ],
    );

    let users = unwrap_outcome(rt.block_on(
        orm.select("user")
            .unwrap()
            .load("posts", LoadMethod::Postload)
            .fetch_all(&cx, &mut map),
    ));

    let queries = conn.queries();
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[1].1, vec![Value::BigInt(1), Value::BigInt(2)]);
    assert_eq!(
        titles(&users[0]),
        vec![Value::from("a"), Value::from("b"), Value::from("c")]
    );
    assert!(users[1].related_many("posts").unwrap().is_empty());
}

#[test]
fn test_entity_map_scopes_instance_identity() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let orm = blog_orm(&conn);

    let mut first_map = orm.entity_map();
    user_rows(&conn);
    user_rows(&conn);
    user_rows(&conn);
    let a = unwrap_outcome(rt.block_on(orm.select("user").unwrap().fetch_all(&cx, &mut first_map)));
    let b = unwrap_outcome(rt.block_on(orm.select("user").unwrap().fetch_all(&cx, &mut first_map)));
    assert!(a[0].ptr_eq(&b[0]));
    assert!(a[1].ptr_eq(&b[1]));
    assert_eq!(first_map.len(), 2);

    let mut second_map = orm.entity_map();
    let c = unwrap_outcome(rt.block_on(orm.select("user").unwrap().fetch_all(&cx, &mut second_map)));
    assert!(!a[0].ptr_eq(&c[0]));
    assert_eq!(a[0].get("name"), c[0].get("name"));
}

#[test]
fn test_belongs_to_postload_shares_the_parent_instance() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let orm = blog_orm(&conn);
    let mut map = orm.entity_map();

    conn.push_rows(
        &["id", "title", "user_id"],
        vec![
            vec![Value::BigInt(10), Value::from("a"), Value::BigInt(1)],
            vec![Value::BigInt(11), Value::from("b"), Value::BigInt(1)],
            vec![Value::BigInt(12), Value::from("c"), Value::BigInt(2)],
        ],
    );
    user_rows(&conn);

    let posts = unwrap_outcome(rt.block_on(
        orm.select("post")
            .unwrap()
            .load("author", LoadMethod::Postload)
            .fetch_all(&cx, &mut map),
    ));

    let queries = conn.queries();
    assert_eq!(queries.len(), 2);
    assert_eq!(
        queries[1].0,
        concat!(
            r#"SELECT "post_author"."id", "post_author"."name" FROM "users" AS "post_author" "#,
            r#"WHERE "post_author"."id" IN ($1, $2)"#
        )
    );
    assert_eq!(queries[1].1, vec![Value::BigInt(1), Value::BigInt(2)]);

    let first = posts[0].related("author").unwrap().unwrap();
    let second = posts[1].related("author").unwrap().unwrap();
    let third = posts[2].related("author").unwrap().unwrap();
    assert!(first.ptr_eq(&second));
    assert!(!first.ptr_eq(&third));
    assert_eq!(third.get("name"), Some(Value::from("Bob")));
}

#[test]
fn test_linking_a_loaded_tag_again_updates_the_pivot_row() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let orm = blog_orm(&conn);
    let mut map = orm.entity_map();

    conn.push_rows(
        &[
            "id", "title", "user_id", "post_id", "tag_id", "weight", "id", "name",
        ],
        vec![
            vec![
                Value::BigInt(1),
                Value::from("Hello"),
                Value::BigInt(3),
                Value::BigInt(1),
                Value::BigInt(7),
                Value::BigInt(2),
                Value::BigInt(7),
                Value::from("rust"),
            ],
            vec![
                Value::BigInt(1),
                Value::from("Hello"),
                Value::BigInt(3),
                Value::BigInt(1),
                Value::BigInt(8),
                Value::BigInt(1),
                Value::BigInt(8),
                Value::from("sql"),
            ],
        ],
    );

    let post = unwrap_outcome(rt.block_on(
        orm.select("post")
            .unwrap()
            .load("tags", LoadMethod::Inload)
            .fetch_one(&cx, &mut map),
    ))
    .unwrap();
    assert_eq!(conn.queries().len(), 1);
    assert!(!conn.queries()[0].0.contains("LIMIT"));

    let tags = post.related_many("tags").unwrap();
    assert_eq!(tags.len(), 2);
    let rust = tags[0].clone();
    assert_eq!(
        post.get_pivot("tags", &rust).unwrap(),
        vec![("weight".to_string(), Value::BigInt(2))]
    );
    assert!(post.has("tags", &Criteria::field("name", "sql")).unwrap());

    post.link("tags", rust.clone(), vec![("weight".to_string(), Value::BigInt(5))])
        .unwrap();
    assert_eq!(
        post.get_pivot("tags", &rust).unwrap(),
        vec![("weight".to_string(), Value::BigInt(5))]
    );

    let mut graph = orm.command_graph();
    graph.store(&post, true).unwrap();
    assert!(graph.labels().contains(&"update post_tags"));
    unwrap_outcome(rt.block_on(orm.run(&cx, graph)));

    let writes = conn.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(
        writes[0].0,
        r#"UPDATE "post_tags" SET "weight" = $1 WHERE "post_id" = $2 AND "tag_id" = $3"#
    );
    assert_eq!(
        writes[0].1,
        vec![Value::BigInt(5), Value::BigInt(1), Value::BigInt(7)]
    );
}

#[test]
fn test_configured_cache_limit_bounds_the_entity_map() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = MockConnection::new();
    let config = OrmConfig::from_json(r#"{"entity_cache_limit": 1}"#).unwrap();
    let orm = Orm::with_config(blog_registry(), conn.clone(), config).unwrap();
    let mut map = orm.entity_map();

    user_rows(&conn);
    let err = match rt.block_on(orm.select("user").unwrap().fetch_all(&cx, &mut map)) {
        Outcome::Err(e) => e,
        _ => panic!("expected the entity map to overflow"),
    };
    assert!(matches!(err, Error::Cache(_)));
}
