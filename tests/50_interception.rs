// Interception layer end to end: audit filling, soft-delete filtering,
// shaping, and hard deletes, over the in-memory engine.

use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};

use chat_gateway::data::capabilities::parse_entities;
use chat_gateway::data::{with_actor, ActorIdentity, DataError, DataService};
use chat_gateway::database::engine::JsonMap;
use chat_gateway::database::{MemoryEngine, QueryArgs};

const SCHEMA: &str = r#"
entity Conversation {
  id             String   @id
  conversationId String   @unique
  userId         String
  name           String
  deleted        Boolean  @default(false)
  deletedAt      DateTime?
  deletedBy      String?
  createdAt      DateTime @default(now())
  createdBy      String
  updatedAt      DateTime @updatedAt
  updatedBy      String
}
"#;

fn setup() -> (DataService, MemoryEngine) {
    let engine = MemoryEngine::new();
    let service = DataService::with_capabilities(Arc::new(engine.clone()), parse_entities(SCHEMA));
    (service, engine)
}

fn actor(code: &str) -> ActorIdentity {
    ActorIdentity::new(Some(code.to_string()), None)
}

fn row(v: Value) -> JsonMap {
    v.as_object().cloned().unwrap_or_default()
}

#[tokio::test]
async fn create_fills_audit_fields() -> Result<()> {
    let (service, _) = setup();
    let created = with_actor(actor("alice"), async {
        service.entity("Conversation").create(row(json!({ "id": "c1", "name": "first" }))).await
    })
    .await?;

    assert_eq!(created["createdBy"], json!("alice"));
    assert!(created.get("createdAt").and_then(Value::as_str).is_some());
    assert_eq!(created["deleted"], json!(false));
    Ok(())
}

#[tokio::test]
async fn update_fills_update_fields_and_keeps_creation_fields() -> Result<()> {
    let (service, _) = setup();
    let set = service.entity("Conversation");

    let created = with_actor(actor("alice"), async {
        set.create(row(json!({ "id": "c1", "name": "first" }))).await
    })
    .await?;

    let updated = with_actor(actor("bob"), async {
        set.update(&json!({ "id": "c1" }), row(json!({ "name": "renamed" }))).await
    })
    .await?;

    assert_eq!(updated["updatedBy"], json!("bob"));
    assert!(updated.get("updatedAt").and_then(Value::as_str).is_some());
    assert_eq!(updated["createdBy"], json!("alice"));
    assert_eq!(updated["createdAt"], created["createdAt"]);
    Ok(())
}

#[tokio::test]
async fn soft_delete_is_a_filtered_update_not_a_physical_delete() -> Result<()> {
    let (service, engine) = setup();
    let set = service.entity("Conversation");

    with_actor(actor("alice"), async {
        set.create(row(json!({ "id": "c1" }))).await?;
        set.delete(&json!({ "id": "c1" })).await
    })
    .await?;

    // Raw physical view still has the row, flagged.
    let physical = engine.table_snapshot("Conversation").await;
    assert_eq!(physical.len(), 1);
    assert_eq!(physical[0]["deleted"], json!(true));
    assert_eq!(physical[0]["deletedBy"], json!("alice"));
    assert!(physical[0].get("deletedAt").and_then(Value::as_str).is_some());
    Ok(())
}

#[tokio::test]
async fn default_reads_exclude_soft_deleted() -> Result<()> {
    let (service, _) = setup();
    let set = service.entity("Conversation");

    set.create(row(json!({ "id": "kept" }))).await?;
    set.create(row(json!({ "id": "gone" }))).await?;
    set.delete(&json!({ "id": "gone" })).await?;

    let all = set.find_many(QueryArgs::default()).await?;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0]["id"], json!("kept"));

    let first = set.find_first(QueryArgs::filtered(json!({ "id": "gone" }))).await?;
    assert!(first.is_none());

    let unique = set.find_unique(row(json!({ "id": "gone" })), false).await?;
    assert!(unique.is_none());
    Ok(())
}

#[tokio::test]
async fn include_deleted_round_trip() -> Result<()> {
    let (service, _) = setup();
    let set = service.entity("Conversation");

    set.create(row(json!({ "id": "c1" }))).await?;
    set.delete(&json!({ "id": "c1" })).await?;

    let rows = set.find_many(QueryArgs::default().with_deleted()).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["deleted"], json!(true));
    Ok(())
}

#[tokio::test]
async fn shaping_hides_bookkeeping_from_default_reads() -> Result<()> {
    let (service, _) = setup();
    let set = service.entity("Conversation");

    set.create(row(json!({ "id": "c1" }))).await?;
    let rows = set.find_many(QueryArgs::default()).await?;
    assert!(!rows[0].contains_key("deleted"));
    assert!(!rows[0].contains_key("deletedAt"));
    assert!(!rows[0].contains_key("deletedBy"));
    Ok(())
}

#[tokio::test]
async fn or_throw_distinguishes_soft_deleted() -> Result<()> {
    let (service, _) = setup();
    let set = service.entity("Conversation");

    set.create(row(json!({ "id": "c1" }))).await?;
    set.delete(&json!({ "id": "c1" })).await?;

    let err = set.find_unique_or_throw(row(json!({ "id": "c1" })), false).await.unwrap_err();
    match err {
        DataError::NotFound { ref entity, soft_deleted } => {
            assert_eq!(entity, "Conversation");
            assert!(soft_deleted);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let found = set.find_unique_or_throw(row(json!({ "id": "c1" })), true).await?;
    assert_eq!(found["deleted"], json!(true));
    Ok(())
}

#[tokio::test]
async fn hard_delete_bypasses_soft_delete() -> Result<()> {
    let (service, engine) = setup();
    let set = service.entity("Conversation");

    set.create(row(json!({ "id": "c1" }))).await?;
    set.hard_delete(&json!({ "id": "c1" })).await?;

    let rows = set.find_many(QueryArgs::default().with_deleted()).await?;
    assert!(rows.is_empty());
    assert!(engine.table_snapshot("Conversation").await.is_empty());
    Ok(())
}

#[tokio::test]
async fn aggregates_see_the_soft_delete_filter() -> Result<()> {
    let (service, _) = setup();
    let set = service.entity("Conversation");

    set.create(row(json!({ "id": "a", "userId": "u1" }))).await?;
    set.create(row(json!({ "id": "b", "userId": "u1" }))).await?;
    set.delete(&json!({ "id": "b" })).await?;

    assert_eq!(set.count(QueryArgs::default()).await?, 1);
    assert_eq!(set.count(QueryArgs::default().with_deleted()).await?, 2);

    let groups = set
        .group_by(
            QueryArgs::default(),
            &["userId".to_string()],
            &[chat_gateway::database::AggregateOp::Count],
        )
        .await?;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["_count"], json!(1));
    Ok(())
}

#[tokio::test]
async fn delete_many_soft_deletes_every_match() -> Result<()> {
    let (service, engine) = setup();
    let set = service.entity("Conversation");

    set.create(row(json!({ "id": "a", "userId": "u1" }))).await?;
    set.create(row(json!({ "id": "b", "userId": "u1" }))).await?;
    let affected = set.delete_many(&json!({ "userId": "u1" })).await?;
    assert_eq!(affected, 2);

    assert!(set.find_many(QueryArgs::default()).await?.is_empty());
    assert_eq!(engine.table_snapshot("Conversation").await.len(), 2);
    Ok(())
}

#[tokio::test]
async fn unknown_actor_writes_as_system() -> Result<()> {
    let (service, _) = setup();
    let created =
        service.entity("Conversation").create(row(json!({ "id": "c1" }))).await?;
    assert_eq!(created["createdBy"], json!("system"));
    Ok(())
}
