//! Boot demo: registers Post/Tag resources, boots the configured backend, then attaches tags to a
//! post and lists them. `RESOURCE_ENGINE_BACKEND=postgres` with `DATABASE_URL` uses PostgreSQL.

use resource_engine::config::{belongs_to_many, integer, resource, text};
use resource_engine::{boot, FetchQuery, Record, Settings};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("resource_engine=info".parse()?))
        .init();

    let settings = Settings::from_env()?;
    let (state, report) = boot(
        &settings,
        [
            resource("Post").fields([
                text("Title").searchable().not_nullable(),
                integer("Views").default(0),
                belongs_to_many("Tag"),
            ]),
            resource("Tag").fields([text("Name").unique().searchable()]),
        ],
    )
    .await?;
    tracing::info!(derived = report.derived, inserted = report.inserted, "booted");

    let post = state.resource("post")?.clone();
    let tag = state.resource("tag")?.clone();
    let repo = state.repository.clone();

    let mut tag_ids = Vec::new();
    for name in ["rust", "databases"] {
        let mut payload = Record::new();
        payload.insert("name".into(), json!(name));
        match repo.find_one_by_field(&tag, "name", &json!(name), None).await? {
            Some(existing) => tag_ids.push(existing["id"].clone()),
            None => tag_ids.push(repo.create(&tag, payload, Record::new()).await?["id"].clone()),
        }
    }

    let mut payload = Record::new();
    payload.insert("title".into(), json!("Hello relationships"));
    let mut relationships = Record::new();
    relationships.insert("tags".into(), json!(tag_ids));
    let created = state.create_validated(&post, payload, relationships).await?;

    let page = repo
        .find_all_belonging_to_many(&post, &tag, &created["id"], &FetchQuery::new())
        .await?;
    println!("{}", serde_json::to_string_pretty(&page)?);
    Ok(())
}
