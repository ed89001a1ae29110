use chrono::{Duration, Utc};
use resource_engine::config::{belongs_to, belongs_to_many, has_many, integer, resource, text};
use resource_engine::relation;
use resource_engine::{
    bootstrap_permissions, create_administrator, AggregateRange, AppError, DocumentRepository, FetchQuery,
    Operator, Record, Registry, Repository, ResourceDescriptor,
};
use serde_json::{json, Value};
use std::sync::Arc;

fn blog() -> DocumentRepository {
    let registry = Registry::register([
        resource("Post").fields([
            text("Title").searchable(),
            integer("Views"),
            belongs_to_many("Tag"),
            has_many("Comment"),
        ]),
        resource("Tag").fields([text("Name").unique().searchable(), belongs_to_many("Post")]),
        resource("Comment").fields([text("Body"), belongs_to("Post")]),
    ])
    .unwrap();
    DocumentRepository::new(Arc::new(registry))
}

fn res(repo: &DocumentRepository, name: &str) -> ResourceDescriptor {
    repo.registry().require(name).unwrap().clone()
}

fn record(v: Value) -> Record {
    v.as_object().cloned().unwrap()
}

async fn seed_posts(repo: &DocumentRepository, n: usize) {
    let post = res(repo, "Post");
    for i in 1..=n {
        repo.create(&post, record(json!({"title": format!("post {}", i), "views": i})), Record::new())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn tags_attached_to_post_five_page() {
    let repo = blog();
    let post = res(&repo, "Post");
    let tag = res(&repo, "Tag");
    seed_posts(&repo, 5).await;
    for name in ["rust", "sql"] {
        repo.create(&tag, record(json!({"name": name})), Record::new())
            .await
            .unwrap();
    }

    relation::resolve(repo.registry(), &post, "tags")
        .unwrap()
        .attach(&repo, &json!(5), &[json!(1), json!(2)])
        .await
        .unwrap();

    let page = repo
        .find_all_belonging_to_many(&post, &tag, &json!(5), &FetchQuery::new())
        .await
        .unwrap();
    assert_eq!(page.total, 2);
    assert_eq!((page.page, page.per_page, page.page_count), (1, 10, 1));
    let names: Vec<_> = page.data.iter().map(|r| r["name"].clone()).collect();
    assert_eq!(names, vec![json!("rust"), json!("sql")]);

    let envelope = serde_json::to_value(&page).unwrap();
    assert_eq!(envelope["perPage"], json!(10));
    assert_eq!(envelope["pageCount"], json!(1));
}

#[tokio::test]
async fn relationship_payload_round_trips_without_duplicates() {
    let repo = blog();
    let post = res(&repo, "Post");
    let tag = res(&repo, "Tag");
    for name in ["a", "b", "c"] {
        repo.create(&tag, record(json!({"name": name})), Record::new())
            .await
            .unwrap();
    }
    let created = repo
        .create(&post, record(json!({"title": "hello"})), record(json!({"tags": [1, 3, 3]})))
        .await
        .unwrap();

    let listed = repo
        .find_all_belonging_to_many_data(&post, &tag, &created["id"], &FetchQuery::new())
        .await
        .unwrap();
    let ids: Vec<_> = listed.iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!(1), json!(3)]);
    assert_eq!(
        repo.find_all_belonging_to_many_count(&post, &tag, &created["id"], &FetchQuery::new())
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn related_listing_paginates_by_per_page() {
    let repo = blog();
    let post = res(&repo, "Post");
    let tag = res(&repo, "Tag");
    let mut ids = Vec::new();
    for i in 0..5 {
        let t = repo
            .create(&tag, record(json!({"name": format!("t{}", i)})), Record::new())
            .await
            .unwrap();
        ids.push(t["id"].clone());
    }
    repo.create(&post, record(json!({"title": "p"})), record(json!({ "tags": ids })))
        .await
        .unwrap();

    let page = repo
        .find_all_belonging_to_many(&post, &tag, &json!("1"), &FetchQuery::new().page(2).per_page(2))
        .await
        .unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.page_count, 3);
    assert_eq!(page.data.len(), 2);
    assert_eq!(page.data[0]["name"], json!("t2"));

    let missing = repo
        .find_all_belonging_to_many(&post, &tag, &json!(42), &FetchQuery::new())
        .await
        .unwrap_err();
    assert!(matches!(missing, AppError::NotFound(_)));
}

#[tokio::test]
async fn has_many_listing_filters_and_searches() {
    let repo = blog();
    let post = res(&repo, "Post");
    let comment = res(&repo, "Comment");
    seed_posts(&repo, 1).await;
    for body in ["first!", "great post", "spam"] {
        repo.create(&comment, record(json!({"body": body, "post": 1})), Record::new())
            .await
            .unwrap();
    }

    let filtered = repo
        .find_all_has_many(
            &post,
            &comment,
            &json!(1),
            &FetchQuery::new().filter("body", Operator::NotIn, "spam"),
        )
        .await
        .unwrap();
    assert_eq!(filtered.total, 2);

    let count = repo
        .find_all_has_many_count(&post, &comment, &json!(1), &FetchQuery::new().filter("id", Operator::Gte, 2))
        .await
        .unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn inverse_sides_list_without_owner_writes() {
    let repo = blog();
    let post = res(&repo, "Post");
    let tag = res(&repo, "Tag");
    let comment = res(&repo, "Comment");
    seed_posts(&repo, 2).await;
    repo.create(&tag, record(json!({"name": "rust"})), Record::new())
        .await
        .unwrap();

    // only the comment names its post
    repo.create(&comment, record(json!({"body": "hi", "post": 1})), Record::new())
        .await
        .unwrap();
    let listed = repo
        .find_all_has_many(&post, &comment, &json!(1), &FetchQuery::new())
        .await
        .unwrap();
    assert_eq!(listed.total, 1);
    assert_eq!(listed.data[0]["body"], json!("hi"));

    // only the post names its tag
    repo.update(&post, &json!(1), Record::new(), record(json!({"tags": [1]})))
        .await
        .unwrap();
    let tagged = repo
        .find_all_belonging_to_many(&tag, &post, &json!(1), &FetchQuery::new())
        .await
        .unwrap();
    assert_eq!(tagged.total, 1);
    assert_eq!(tagged.data[0]["title"], json!("post 1"));

    // reassigning the comment moves it between listings
    repo.update(&comment, &json!(1), record(json!({"post": 2})), Record::new())
        .await
        .unwrap();
    for (id, expected) in [(1, 0), (2, 1)] {
        let count = repo
            .find_all_has_many_count(&post, &comment, &json!(id), &FetchQuery::new())
            .await
            .unwrap();
        assert_eq!(count, expected);
    }

    // detaching from the tag side empties the post side
    relation::resolve(repo.registry(), &tag, "posts")
        .unwrap()
        .detach(&repo, &json!(1), &[json!(1)])
        .await
        .unwrap();
    let p = repo.find_one_by_id(&post, &json!(1), None, &[]).await.unwrap().unwrap();
    assert_eq!(p["tags"], json!([]));
}

#[tokio::test]
async fn string_relationship_ids_are_stored_as_numbers() {
    let repo = blog();
    let post = res(&repo, "Post");
    let tag = res(&repo, "Tag");
    let comment = res(&repo, "Comment");
    for name in ["a", "b"] {
        repo.create(&tag, record(json!({"name": name})), Record::new())
            .await
            .unwrap();
    }
    let created = repo
        .create(&post, record(json!({"title": "p"})), record(json!({"tags": ["1", "2", "2"]})))
        .await
        .unwrap();
    assert_eq!(created["tags"], json!([1, 2]));
    let page = repo
        .find_all_belonging_to_many(&post, &tag, &created["id"], &FetchQuery::new())
        .await
        .unwrap();
    assert_eq!(page.total, 2);

    let c = repo
        .create(&comment, record(json!({"body": "c"})), Record::new())
        .await
        .unwrap();
    let moved = repo
        .update(&comment, &c["id"], Record::new(), record(json!({"post": "1"})))
        .await
        .unwrap();
    assert_eq!(moved["post"], json!(1));
    assert_eq!(
        repo.find_all_has_many_count(&post, &comment, &json!(1), &FetchQuery::new())
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn page_far_past_the_end_is_empty() {
    let repo = blog();
    let tag = res(&repo, "Tag");
    repo.create(&tag, record(json!({"name": "rust"})), Record::new())
        .await
        .unwrap();
    let page = repo
        .find_all(&tag, &FetchQuery::new().page(u64::MAX).per_page(10))
        .await
        .unwrap();
    assert!(page.data.is_empty());
    assert_eq!(page.total, 1);
    assert_eq!(page.page, u64::MAX);
}

#[tokio::test]
async fn bootstrap_is_idempotent_and_grants_everything() {
    let repo = blog();
    let registry = repo.registry().clone();

    let first = bootstrap_permissions(&registry, &repo).await.unwrap();
    assert_eq!(first.derived, 24);
    assert_eq!(first.inserted, 24);

    let second = bootstrap_permissions(&registry, &repo).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.super_admin_id, first.super_admin_id);

    let role = res(&repo, "Administrator Role");
    let permission = res(&repo, "Administrator Permission");
    let granted = repo
        .find_all_belonging_to_many_count(&role, &permission, &second.super_admin_id, &FetchQuery::new())
        .await
        .unwrap();
    assert_eq!(granted, 24);

    let named = repo
        .find_one_by_field(&permission, "slug", &json!("run:post:publish"), None)
        .await
        .unwrap();
    assert!(named.is_none());
    let named = repo
        .find_one_by_field(&permission, "slug", &json!("delete:post"), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(named["name"], json!("Delete post"));
}

#[tokio::test]
async fn administrator_requires_super_admin_role() {
    let repo = blog();
    let registry = repo.registry().clone();
    let payload = record(json!({"name": "Kim", "email": "kim@example.com", "password": "correct horse"}));

    let err = create_administrator(&registry, &repo, payload.clone()).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let report = bootstrap_permissions(&registry, &repo).await.unwrap();
    let admin = create_administrator(&registry, &repo, payload).await.unwrap();
    assert_eq!(admin["administratorRoles"], json!([report.super_admin_id.clone()]));
    assert!(admin["password"].as_str().unwrap().starts_with("$argon2"));

    let role = res(&repo, "Administrator Role");
    let members = repo
        .find_one_by_id(&role, &report.super_admin_id, None, &[])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(members["administrators"], json!([admin["id"].clone()]));
}

#[tokio::test]
async fn population_truncates_deep_paths() {
    let repo = blog();
    let post = res(&repo, "Post");
    let comment = res(&repo, "Comment");
    seed_posts(&repo, 1).await;
    let c = repo
        .create(&comment, record(json!({"body": "hi", "post": 1})), Record::new())
        .await
        .unwrap();

    let found = repo
        .find_one_by_id(&comment, &c["id"], None, &["post.comments.post.comments".to_string()])
        .await
        .unwrap()
        .unwrap();
    let nested_post = &found["post"]["comments"][0]["post"];
    assert_eq!(nested_post["title"], json!("post 1"));
    // fourth segment is dropped: ids stay unresolved
    assert_eq!(nested_post["comments"], json!([c["id"].clone()]));
}

#[tokio::test]
async fn empty_search_equals_no_search() {
    let repo = blog();
    let post = res(&repo, "Post");
    seed_posts(&repo, 12).await;

    let plain = repo.find_all(&post, &FetchQuery::new()).await.unwrap();
    let empty = repo.find_all(&post, &FetchQuery::new().search("")).await.unwrap();
    assert_eq!(plain, empty);
    assert_eq!(plain.total, 12);
    assert_eq!(plain.page_count, 2);

    let searched = repo.find_all(&post, &FetchQuery::new().search("post 1")).await.unwrap();
    // "post 1", "post 10", "post 11", "post 12"
    assert_eq!(searched.total, 4);
}

#[tokio::test]
async fn range_filters_and_field_selection() {
    let repo = blog();
    let post = res(&repo, "Post");
    seed_posts(&repo, 12).await;

    let page = repo
        .find_all(
            &post,
            &FetchQuery::new()
                .filter("views", Operator::Gte, 5)
                .filter("views", Operator::Lte, 10)
                .fields(["title"]),
        )
        .await
        .unwrap();
    assert_eq!(page.total, 6);
    assert!(page.data.iter().all(|r| r.len() == 2 && r.contains_key("id")));
}

#[tokio::test]
async fn unknown_filter_field_is_validation_error() {
    let repo = blog();
    let post = res(&repo, "Post");
    let err = repo
        .find_all(&post, &FetchQuery::new().filter("nope", Operator::Equals, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = repo
        .find_all(&post, &FetchQuery::new().filter("tags", Operator::In, json!([1])))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn undeclared_relationship_is_configuration_error() {
    let repo = blog();
    let tag = res(&repo, "Tag");
    let post = res(&repo, "Post");
    let err = repo
        .find_all_has_many(&tag, &post, &json!(1), &FetchQuery::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Configuration(_)));

    let err = repo
        .find_one_by_id(&post, &json!(1), None, &["authors".to_string()])
        .await;
    // missing record short-circuits before population
    assert!(matches!(err, Ok(None)));
}

#[tokio::test]
async fn unique_fields_conflict() {
    let repo = blog();
    let tag = res(&repo, "Tag");
    repo.create(&tag, record(json!({"name": "rust"})), Record::new())
        .await
        .unwrap();
    let other = repo
        .create(&tag, record(json!({"name": "go"})), Record::new())
        .await
        .unwrap();

    let err = repo
        .create(&tag, record(json!({"name": "rust"})), Record::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(err.status().as_u16(), 422);

    let err = repo
        .update(&tag, &other["id"], record(json!({"name": "rust"})), Record::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    // renaming to its own value is not a conflict
    repo.update(&tag, &other["id"], record(json!({"name": "go"})), Record::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn hooks_transform_payloads() {
    let registry = Registry::register([resource("Note")
        .fields([text("Title"), text("Slug")])
        .before_create(|mut r: Record| {
            let title = r.get("title").and_then(Value::as_str).unwrap_or_default().to_string();
            r.insert("slug".into(), json!(title.to_lowercase().replace(' ', "-")));
            r
        })
        .before_update(|mut r: Record| {
            r.remove("slug");
            r
        })])
    .unwrap();
    let repo = DocumentRepository::new(Arc::new(registry));
    let note = res(&repo, "Note");

    let created = repo
        .create(&note, record(json!({"title": "Hello World", "unknown": 1})), Record::new())
        .await
        .unwrap();
    assert_eq!(created["slug"], json!("hello-world"));
    assert!(!created.contains_key("unknown"));

    let updated = repo
        .update(&note, &created["id"], record(json!({"title": "Bye", "slug": "x"})), Record::new())
        .await
        .unwrap();
    assert_eq!(updated["slug"], json!("hello-world"));
    assert_eq!(updated["title"], json!("Bye"));
}

#[tokio::test]
async fn aggregates_over_created_at_range() {
    let repo = blog();
    let post = res(&repo, "Post");
    for views in [2, 4, 9] {
        repo.create(&post, record(json!({"title": "x", "views": views})), Record::new())
            .await
            .unwrap();
    }
    let now = Utc::now();
    let current = AggregateRange::new(now - Duration::hours(1), now + Duration::hours(1));
    let past = AggregateRange::new(now - Duration::days(2), now - Duration::days(1));
    let views = ["views".to_string()];

    assert_eq!(repo.aggregate_count(&post, &current).await.unwrap(), 3.0);
    assert_eq!(repo.aggregate_avg(&post, &current, &views).await.unwrap(), 5.0);
    assert_eq!(repo.aggregate_min(&post, &current, &views).await.unwrap(), 2.0);
    assert_eq!(repo.aggregate_max(&post, &current, &views).await.unwrap(), 9.0);
    assert_eq!(repo.aggregate_count(&post, &past).await.unwrap(), 0.0);
    assert_eq!(repo.aggregate_avg(&post, &past, &views).await.unwrap(), 0.0);

    let err = repo.aggregate_avg(&post, &current, &[]).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    let err = repo
        .aggregate_max(&post, &current, &["nope".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn delete_removes_dangling_ids() {
    let repo = blog();
    let post = res(&repo, "Post");
    let tag = res(&repo, "Tag");
    let comment = res(&repo, "Comment");
    for name in ["a", "b"] {
        repo.create(&tag, record(json!({"name": name})), Record::new())
            .await
            .unwrap();
    }
    repo.create(&post, record(json!({"title": "p"})), record(json!({"tags": [1, 2]})))
        .await
        .unwrap();
    repo.create(&comment, record(json!({"body": "c", "post": 1})), Record::new())
        .await
        .unwrap();

    assert!(repo.delete_by_id(&tag, &json!(1)).await.unwrap());
    assert!(!repo.delete_by_id(&tag, &json!(1)).await.unwrap());
    let p = repo.find_one_by_id(&post, &json!(1), None, &[]).await.unwrap().unwrap();
    assert_eq!(p["tags"], json!([2]));

    assert!(repo.delete_by_id(&post, &json!("1")).await.unwrap());
    let c = repo.find_one_by_id(&comment, &json!(1), None, &[]).await.unwrap().unwrap();
    assert_eq!(c["post"], Value::Null);
}

#[tokio::test]
async fn update_of_missing_record_is_not_found() {
    let repo = blog();
    let post = res(&repo, "Post");
    let err = repo
        .update(&post, &json!(7), record(json!({"title": "x"})), Record::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert_eq!(err.status().as_u16(), 404);
}
