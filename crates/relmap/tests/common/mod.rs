//! The in-memory connection and a small blog schema shared by the
//! integration tests.
#![allow(dead_code)]

use relmap::prelude::*;

pub use relmap_orm::test_support::{MockConnection, unwrap_outcome};

/// Users with posts, posts with an author and tags, users with a profile.
pub fn blog_registry() -> SchemaRegistry {
    SchemaRegistry::new()
        .with(
            EntitySchema::builder("user")
                .table("users")
                .primary_key("id")
                .column("name")
                .relation("posts", RelationSchema::has_many("post", "id", "user_id"))
                .relation("profile", RelationSchema::has_one("profile", "id", "user_id"))
                .build()
                .unwrap(),
        )
        .unwrap()
        .with(
            EntitySchema::builder("post")
                .table("posts")
                .primary_key("id")
                .column("title")
                .column("user_id")
                .relation(
                    "author",
                    RelationSchema::belongs_to("user", "user_id", "id").nullable(false),
                )
                .relation(
                    "tags",
                    RelationSchema::many_to_many(
                        "tag",
                        "id",
                        "id",
                        PivotSchema::new("post_tags", "post_id", "tag_id")
                            .default_value("weight", 1_i64),
                    ),
                )
                .build()
                .unwrap(),
        )
        .unwrap()
        .with(
            EntitySchema::builder("tag")
                .table("tags")
                .primary_key("id")
                .column("name")
                .build()
                .unwrap(),
        )
        .unwrap()
        .with(
            EntitySchema::builder("profile")
                .table("profiles")
                .primary_key("id")
                .column("bio")
                .column("user_id")
                .build()
                .unwrap(),
        )
        .unwrap()
}

pub fn blog_orm(conn: &MockConnection) -> Orm<MockConnection> {
    Orm::new(blog_registry(), conn.clone()).unwrap()
}
