// Transactional conversation writer: find-or-create plus message pair
// plus counter bump, all or nothing.

use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};

use chat_gateway::chat::{ChatService, SaveMessagesInput};
use chat_gateway::data::capabilities::parse_entities;
use chat_gateway::data::{with_actor, ActorIdentity, DataService};
use chat_gateway::database::engine::JsonMap;
use chat_gateway::database::{MemoryEngine, QueryArgs};
use chat_gateway::provider::ProviderClient;

const SCHEMA: &str = r#"
entity Conversation {
  id             String   @id
  conversationId String   @unique
  userId         String
  name           String
  messageCount   Int      @default(0)
  status         String   @default("ACTIVE")
  deleted        Boolean  @default(false)
  deletedAt      DateTime?
  deletedBy      String?
  createdAt      DateTime @default(now())
  createdBy      String
  updatedAt      DateTime @updatedAt
  updatedBy      String
}

entity Message {
  id              String   @id
  conversationId  String
  role            String
  content         String
  contentType     String   @default("text")
  parentMessageId String?
  metadata        Json?
  status          String   @default("COMPLETED")
  deleted         Boolean  @default(false)
  deletedAt       DateTime?
  deletedBy       String?
  createdAt       DateTime @default(now())
  createdBy       String
  updatedAt       DateTime @updatedAt
  updatedBy       String
}
"#;

fn setup() -> (ChatService, DataService, MemoryEngine) {
    let engine = MemoryEngine::new();
    let data = DataService::with_capabilities(Arc::new(engine.clone()), parse_entities(SCHEMA));
    // The provider is never called by the writer.
    let chat = ChatService::new(data.clone(), ProviderClient::new("http://localhost:1", "", 1));
    (chat, data, engine)
}

fn input(conversation_id: &str, message_id: Option<&str>) -> SaveMessagesInput {
    SaveMessagesInput {
        conversation_id: conversation_id.to_string(),
        user_id: "u1".to_string(),
        query: "hi".to_string(),
        answer: "hello".to_string(),
        message_id: message_id.map(str::to_string),
        metadata: Value::Null,
        status: None,
    }
}

#[tokio::test]
async fn fresh_conversation_gets_created_with_message_pair() -> Result<()> {
    let (chat, data, _) = setup();

    let saved = chat.save_conversation_with_messages(input("c1", Some("m1"))).await?;

    assert_eq!(saved.conversation["messageCount"], json!(2));
    assert_eq!(saved.conversation["name"], json!("hi"));
    assert_eq!(saved.query_message["id"], json!("m1_query"));
    assert_eq!(saved.query_message["role"], json!("USER"));
    assert_eq!(saved.answer_message["id"], json!("m1"));
    assert_eq!(saved.answer_message["role"], json!("ASSISTANT"));
    assert_eq!(saved.answer_message["parentMessageId"], json!("m1_query"));

    let conversations =
        data.entity("Conversation").find_many(QueryArgs::default()).await?;
    assert_eq!(conversations.len(), 1);

    let messages = data.entity("Message").find_many(QueryArgs::default()).await?;
    assert_eq!(messages.len(), 2);
    Ok(())
}

#[tokio::test]
async fn existing_conversation_is_reused_and_counter_accumulates() -> Result<()> {
    let (chat, data, _) = setup();

    chat.save_conversation_with_messages(input("c1", Some("m1"))).await?;
    chat.save_conversation_with_messages(input("c1", Some("m2"))).await?;

    let conversations =
        data.entity("Conversation").find_many(QueryArgs::default()).await?;
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0]["messageCount"], json!(4));

    let messages = data.entity("Message").find_many(QueryArgs::default()).await?;
    assert_eq!(messages.len(), 4);
    Ok(())
}

#[tokio::test]
async fn missing_message_id_falls_back_to_derived_ids() -> Result<()> {
    let (chat, _, _) = setup();

    let saved = chat.save_conversation_with_messages(input("c9", None)).await?;
    assert_eq!(saved.query_message["id"], json!("c9_query"));
    assert_eq!(saved.answer_message["id"], json!("c9_answer"));
    assert_eq!(saved.answer_message["parentMessageId"], json!("c9_query"));
    Ok(())
}

#[tokio::test]
async fn conversation_name_is_query_prefix() -> Result<()> {
    let (chat, data, _) = setup();

    let mut long = input("c1", Some("m1"));
    long.query = "x".repeat(80);
    chat.save_conversation_with_messages(long).await?;

    let conversations =
        data.entity("Conversation").find_many(QueryArgs::default()).await?;
    let name = conversations[0]["name"].as_str().unwrap();
    assert_eq!(name.len(), 50);
    Ok(())
}

#[tokio::test]
async fn failed_exchange_status_lands_on_the_answer_message() -> Result<()> {
    let (chat, data, _) = setup();

    let mut failed = input("c1", Some("m1"));
    failed.status = Some("FAILED".to_string());
    let saved = chat.save_conversation_with_messages(failed).await?;

    // The user's question still completed; only the answer carries it.
    assert_eq!(saved.query_message["status"], json!("COMPLETED"));
    assert_eq!(saved.answer_message["status"], json!("FAILED"));

    let messages = data
        .entity("Message")
        .find_many(QueryArgs::filtered(json!({ "role": "ASSISTANT" })))
        .await?;
    assert_eq!(messages[0]["status"], json!("FAILED"));
    Ok(())
}

#[tokio::test]
async fn writer_records_the_ambient_actor() -> Result<()> {
    let (chat, _, engine) = setup();

    with_actor(ActorIdentity::new(Some("alice".into()), None), async {
        chat.save_conversation_with_messages(input("c1", Some("m1"))).await
    })
    .await?;

    let messages = engine.table_snapshot("Message").await;
    assert_eq!(messages.len(), 2);
    for message in &messages {
        assert_eq!(message["createdBy"], json!("alice"));
    }
    Ok(())
}

#[tokio::test]
async fn failed_transaction_leaves_no_partial_state() -> Result<()> {
    let (_, data, engine) = setup();

    let tx = data.begin().await?;
    let conversations = tx.entity("Conversation");
    conversations
        .create(row(json!({ "id": "c1", "conversationId": "c1", "messageCount": 0 })))
        .await?;
    // Counter bump against a row that does not exist fails the unit.
    let bump_result = conversations
        .update(&json!({ "conversationId": "nope" }), row(json!({ "messageCount": {"$inc": 2} })))
        .await;
    assert!(bump_result.is_err());
    tx.rollback().await?;

    assert!(engine.table_snapshot("Conversation").await.is_empty());
    Ok(())
}

fn row(v: Value) -> JsonMap {
    v.as_object().cloned().unwrap_or_default()
}
