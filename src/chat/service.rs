//! Chat orchestration: proxies the provider and persists conversation
//! history through the intercepted data layer.
//!
//! The transactional writer is the one multi-statement sequence in the
//! gateway: find-or-create the conversation, insert the user/assistant
//! message pair, bump the counter, all inside a single transaction.

use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::config;
use crate::data::actor::{capture_actor, with_actor};
use crate::data::error::DataError;
use crate::data::service::{DataService, DataTransaction};
use crate::database::engine::{JsonMap, QueryArgs};
use crate::provider::client::ProviderClient;
use crate::provider::error::ProviderError;
use crate::provider::types::{ChatMessageResponse, ChatRequest, StreamEvent};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Clone)]
pub struct SaveMessagesInput {
    pub conversation_id: String,
    pub user_id: String,
    pub query: String,
    pub answer: String,
    pub message_id: Option<String>,
    pub metadata: Value,
    /// Recorded on the answer message; `None` means `COMPLETED`.
    pub status: Option<String>,
}

/// Rows touched by one successful save.
#[derive(Debug, Serialize)]
pub struct SavedMessages {
    pub conversation: JsonMap,
    pub query_message: JsonMap,
    pub answer_message: JsonMap,
}

#[derive(Debug, Serialize)]
pub struct ChatAnswer {
    pub conversation_id: String,
    pub message_id: String,
    pub answer: String,
    pub metadata: Value,
}

#[derive(Debug, Serialize)]
pub struct Paginated {
    pub items: Vec<JsonMap>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

#[derive(Clone)]
pub struct ChatService {
    data: DataService,
    provider: ProviderClient,
}

impl ChatService {
    pub fn new(data: DataService, provider: ProviderClient) -> Self {
        Self { data, provider }
    }

    /// Blocking chat: one provider round trip, then persist the pair.
    /// A persistence failure is logged but does not cost the caller the
    /// answer the provider already produced.
    pub async fn chat(
        &self,
        user_id: &str,
        query: &str,
        conversation_id: Option<String>,
    ) -> Result<ChatAnswer, ChatError> {
        let request = ChatRequest::new(query, user_id).with_conversation(conversation_id);
        let response = self.provider.chat(&request).await?;
        Ok(self.record_blocking_exchange(user_id, query, response).await)
    }

    async fn record_blocking_exchange(
        &self,
        user_id: &str,
        query: &str,
        response: ChatMessageResponse,
    ) -> ChatAnswer {
        let answer = clean_answer(&response.answer);

        let input = SaveMessagesInput {
            conversation_id: response.conversation_id.clone(),
            user_id: user_id.to_string(),
            query: query.to_string(),
            answer: answer.clone(),
            message_id: Some(response.message_id.clone()),
            metadata: response.metadata.clone(),
            status: None,
        };
        if let Err(e) = self.save_conversation_with_messages(input).await {
            error!("Failed to persist chat exchange: {}", e);
        }

        ChatAnswer {
            conversation_id: response.conversation_id,
            message_id: response.message_id,
            answer,
            metadata: response.metadata,
        }
    }

    /// Streaming chat. Events are forwarded as they arrive; when the
    /// upstream ends the accumulated answer is persisted from a
    /// background task carrying the caller's identity, with the answer
    /// message marked FAILED when an error event was seen. Dropping the
    /// returned stream stops the upstream read (cancellation).
    pub async fn chat_stream(
        &self,
        user_id: &str,
        query: &str,
        conversation_id: Option<String>,
    ) -> Result<BoxStream<'static, Result<StreamEvent, ProviderError>>, ChatError> {
        let request =
            ChatRequest::new(query, user_id).with_conversation(conversation_id.clone());
        let mut upstream = self.provider.chat_stream(&request).await?;

        let (mut tx, rx) = mpsc::channel(32);
        let service = self.clone();
        let actor = capture_actor();
        let user_id = user_id.to_string();
        let query = query.to_string();

        tokio::spawn(async move {
            let mut answer = String::new();
            let mut final_conversation_id = conversation_id;
            let mut final_message_id: Option<String> = None;
            let mut metadata = Value::Null;
            let mut completed = false;
            let mut has_error = false;

            while let Some(item) = upstream.next().await {
                match &item {
                    Ok(StreamEvent::Message { answer: chunk, conversation_id: cid, message_id: mid }) => {
                        answer.push_str(chunk);
                        if final_conversation_id.is_none() {
                            final_conversation_id = cid.clone();
                        }
                        if final_message_id.is_none() {
                            final_message_id = mid.clone();
                        }
                    }
                    Ok(StreamEvent::MessageEnd { conversation_id: cid, message_id: mid, metadata: meta }) => {
                        if cid.is_some() {
                            final_conversation_id = cid.clone();
                        }
                        if mid.is_some() {
                            final_message_id = mid.clone();
                        }
                        metadata = meta.clone();
                        completed = true;
                    }
                    Ok(StreamEvent::Error { .. }) | Err(_) => has_error = true,
                    _ => {}
                }
                if tx.send(item).await.is_err() {
                    info!("Chat stream consumer went away; abandoning upstream");
                    return;
                }
            }

            if !completed && !has_error {
                return;
            }
            let Some(conversation_id) = final_conversation_id else { return };
            let status = if has_error { "FAILED" } else { "COMPLETED" };
            let input = SaveMessagesInput {
                conversation_id,
                user_id,
                query,
                answer: clean_answer(&answer),
                message_id: final_message_id,
                metadata,
                status: Some(status.to_string()),
            };
            if let Err(e) =
                with_actor(actor, service.save_conversation_with_messages(input)).await
            {
                error!("Failed to persist streamed conversation: {}", e);
            }
        });

        Ok(rx.boxed())
    }

    /// Forward a stop request upstream, then flag the interrupted answer
    /// message locally. The bookkeeping update is best effort.
    pub async fn stop_generation(&self, task_id: &str, user_id: &str) -> Result<(), ChatError> {
        self.provider.stop_generation(task_id, user_id).await?;
        self.mark_generation_stopped(task_id).await;
        Ok(())
    }

    async fn mark_generation_stopped(&self, task_id: &str) {
        let mut set = JsonMap::new();
        set.insert("status".into(), json!("STOPPED"));
        let stopped = self
            .data
            .entity("Message")
            .update_many(&json!({ "id": task_id, "status": "STREAMING" }), set)
            .await;
        if let Err(e) = stopped {
            error!("Failed to mark stopped message {}: {}", task_id, e);
        }
    }

    /// Find-or-create the conversation and insert the message pair, all
    /// or nothing.
    pub async fn save_conversation_with_messages(
        &self,
        input: SaveMessagesInput,
    ) -> Result<SavedMessages, ChatError> {
        let tx = self.data.begin().await?;
        match Self::save_in_tx(&tx, &input).await {
            Ok(saved) => {
                tx.commit().await?;
                Ok(saved)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e.into())
            }
        }
    }

    async fn save_in_tx(
        tx: &DataTransaction,
        input: &SaveMessagesInput,
    ) -> Result<SavedMessages, DataError> {
        let conversations = tx.entity("Conversation");
        let conversation_key = json!({ "conversationId": input.conversation_id });

        let existing =
            conversations.find_first(QueryArgs::filtered(conversation_key.clone())).await?;
        if existing.is_none() {
            let name: String = input.query.chars().take(50).collect();
            let mut row = JsonMap::new();
            row.insert("id".into(), json!(Uuid::new_v4().to_string()));
            row.insert("conversationId".into(), json!(input.conversation_id));
            row.insert("userId".into(), json!(input.user_id));
            row.insert("name".into(), json!(name));
            row.insert("messageCount".into(), json!(0));
            row.insert("status".into(), json!("ACTIVE"));
            conversations.create(row).await?;
        }

        let base_id = input.message_id.clone().unwrap_or_else(|| input.conversation_id.clone());
        let query_message_id = format!("{base_id}_query");
        let answer_message_id = input
            .message_id
            .clone()
            .unwrap_or_else(|| format!("{}_answer", input.conversation_id));

        let messages = tx.entity("Message");
        let mut query_row = JsonMap::new();
        query_row.insert("id".into(), json!(query_message_id));
        query_row.insert("conversationId".into(), json!(input.conversation_id));
        query_row.insert("role".into(), json!("USER"));
        query_row.insert("content".into(), json!(input.query));
        query_row.insert("contentType".into(), json!("text"));
        query_row.insert("parentMessageId".into(), Value::Null);
        query_row.insert("status".into(), json!("COMPLETED"));
        let query_message = messages.create(query_row).await?;

        let mut answer_row = JsonMap::new();
        answer_row.insert("id".into(), json!(answer_message_id));
        answer_row.insert("conversationId".into(), json!(input.conversation_id));
        answer_row.insert("role".into(), json!("ASSISTANT"));
        answer_row.insert("content".into(), json!(input.answer));
        answer_row.insert("contentType".into(), json!("text"));
        answer_row.insert("parentMessageId".into(), json!(query_message_id));
        answer_row.insert("metadata".into(), input.metadata.clone());
        answer_row
            .insert("status".into(), json!(input.status.as_deref().unwrap_or("COMPLETED")));
        let answer_message = messages.create(answer_row).await?;

        let mut bump = JsonMap::new();
        bump.insert("messageCount".into(), json!({ "$inc": 2 }));
        let conversation = conversations.update(&conversation_key, bump).await?;

        Ok(SavedMessages { conversation, query_message, answer_message })
    }

    /// Conversation list for one user, newest activity first.
    pub async fn history(
        &self,
        user_id: &str,
        page: i64,
        page_size: Option<i64>,
    ) -> Result<Paginated, ChatError> {
        let api = &config().api;
        let page = page.max(1);
        let size = page_size.unwrap_or(api.history_page_size).clamp(1, api.max_page_size);
        let where_clause = json!({ "userId": user_id, "status": { "$ne": "DELETED" } });

        let conversations = self.data.entity("Conversation");
        let total = conversations.count(QueryArgs::filtered(where_clause.clone())).await?;
        let items = conversations
            .find_many(
                QueryArgs::filtered(where_clause)
                    .with_order(json!("updatedAt desc"))
                    .with_limit(size, Some((page - 1) * size)),
            )
            .await?;
        Ok(Paginated { items, total, page, page_size: size })
    }

    /// Messages of one conversation, oldest first. Errors with not-found
    /// when the conversation does not exist or belongs to someone else.
    pub async fn conversation_messages(
        &self,
        conversation_id: &str,
        user_id: &str,
        page: i64,
        page_size: Option<i64>,
    ) -> Result<Paginated, ChatError> {
        self.owned_conversation(conversation_id, user_id).await?;

        let api = &config().api;
        let page = page.max(1);
        let size = page_size.unwrap_or(api.messages_page_size).clamp(1, api.max_page_size);
        let where_clause = json!({ "conversationId": conversation_id });

        let messages = self.data.entity("Message");
        let total = messages.count(QueryArgs::filtered(where_clause.clone())).await?;
        let items = messages
            .find_many(
                QueryArgs::filtered(where_clause)
                    .with_order(json!("createdAt asc"))
                    .with_limit(size, Some((page - 1) * size)),
            )
            .await?;
        Ok(Paginated { items, total, page, page_size: size })
    }

    pub async fn conversation_detail(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<JsonMap, ChatError> {
        self.owned_conversation(conversation_id, user_id).await
    }

    pub async fn rename_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
        name: &str,
    ) -> Result<JsonMap, ChatError> {
        self.owned_conversation(conversation_id, user_id).await?;
        let mut set = JsonMap::new();
        set.insert("name".into(), json!(name));
        Ok(self
            .data
            .entity("Conversation")
            .update(&json!({ "conversationId": conversation_id }), set)
            .await?)
    }

    pub async fn archive_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<JsonMap, ChatError> {
        self.set_status(conversation_id, user_id, "ARCHIVED").await
    }

    /// Logical removal: the row stays (and keeps its audit trail) but is
    /// excluded from history by status.
    pub async fn delete_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<JsonMap, ChatError> {
        self.set_status(conversation_id, user_id, "DELETED").await
    }

    async fn set_status(
        &self,
        conversation_id: &str,
        user_id: &str,
        status: &str,
    ) -> Result<JsonMap, ChatError> {
        self.owned_conversation(conversation_id, user_id).await?;
        let mut set = JsonMap::new();
        set.insert("status".into(), json!(status));
        Ok(self
            .data
            .entity("Conversation")
            .update(&json!({ "conversationId": conversation_id }), set)
            .await?)
    }

    async fn owned_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<JsonMap, ChatError> {
        let found = self
            .data
            .entity("Conversation")
            .find_first(QueryArgs::filtered(
                json!({ "conversationId": conversation_id, "userId": user_id }),
            ))
            .await?;
        found.ok_or(ChatError::Data(DataError::NotFound {
            entity: "Conversation".to_string(),
            soft_deleted: false,
        }))
    }
}

/// Strip `[SEARCH_PARAMS] { ... }` / `[SEARCH_PARAMS] [ ... ]` control
/// blocks the model sometimes appends to its answer, then collapse runs
/// of three or more newlines left behind to a single blank line.
/// Delimiter matching respects JSON string literals.
pub fn clean_answer(answer: &str) -> String {
    const TAG: &str = "[SEARCH_PARAMS]";
    let mut out = String::with_capacity(answer.len());
    let mut rest = answer;
    while let Some(pos) = rest.find(TAG) {
        out.push_str(&rest[..pos]);
        let after = rest[pos + TAG.len()..].trim_start();
        let close = match after.chars().next() {
            Some('{') => '}',
            Some('[') => ']',
            _ => {
                rest = &rest[pos + TAG.len()..];
                continue;
            }
        };
        let block = &after[1..];
        match json_block_end(block, close) {
            Some(end) => rest = &block[end + 1..],
            // Unterminated block: drop the remainder
            None => rest = "",
        }
    }
    out.push_str(rest);
    collapse_blank_runs(out.trim())
}

/// Byte offset of the delimiter closing a JSON object or array whose
/// opening delimiter was already consumed.
fn json_block_end(s: &str, close: char) -> Option<usize> {
    let open = if close == '}' { '{' } else { '[' };
    let mut depth = 1u32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Replace every run of three or more newlines with a single blank line.
fn collapse_blank_runs(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut run = 0usize;
    for c in s.chars() {
        if c == '\n' {
            run += 1;
            continue;
        }
        for _ in 0..run.min(2) {
            out.push('\n');
        }
        run = 0;
        out.push(c);
    }
    for _ in 0..run.min(2) {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::database::engine::{
        AggregateOp, EngineError, StorageConn, StorageEngine, StorageTransaction,
    };
    use crate::database::memory::MemoryEngine;

    /// Engine that refuses every operation.
    struct DownEngine;

    fn down() -> EngineError {
        EngineError::Unsupported("storage offline")
    }

    #[async_trait]
    impl StorageConn for DownEngine {
        async fn insert(&self, _: &str, _: JsonMap) -> Result<JsonMap, EngineError> {
            Err(down())
        }
        async fn insert_many(&self, _: &str, _: Vec<JsonMap>) -> Result<u64, EngineError> {
            Err(down())
        }
        async fn update(&self, _: &str, _: &Value, _: JsonMap) -> Result<JsonMap, EngineError> {
            Err(down())
        }
        async fn update_many(&self, _: &str, _: &Value, _: JsonMap) -> Result<u64, EngineError> {
            Err(down())
        }
        async fn delete(&self, _: &str, _: &Value) -> Result<JsonMap, EngineError> {
            Err(down())
        }
        async fn delete_many(&self, _: &str, _: &Value) -> Result<u64, EngineError> {
            Err(down())
        }
        async fn find_many(&self, _: &str, _: &QueryArgs) -> Result<Vec<JsonMap>, EngineError> {
            Err(down())
        }
        async fn find_first(
            &self,
            _: &str,
            _: &QueryArgs,
        ) -> Result<Option<JsonMap>, EngineError> {
            Err(down())
        }
        async fn find_unique(
            &self,
            _: &str,
            _: &JsonMap,
        ) -> Result<Option<JsonMap>, EngineError> {
            Err(down())
        }
        async fn count(&self, _: &str, _: &QueryArgs) -> Result<i64, EngineError> {
            Err(down())
        }
        async fn aggregate(
            &self,
            _: &str,
            _: &QueryArgs,
            _: &[AggregateOp],
        ) -> Result<JsonMap, EngineError> {
            Err(down())
        }
        async fn group_by(
            &self,
            _: &str,
            _: &QueryArgs,
            _: &[String],
            _: &[AggregateOp],
        ) -> Result<Vec<JsonMap>, EngineError> {
            Err(down())
        }
        async fn raw_query(&self, _: &str, _: Vec<Value>) -> Result<Vec<JsonMap>, EngineError> {
            Err(down())
        }
        async fn raw_execute(&self, _: &str, _: Vec<Value>) -> Result<u64, EngineError> {
            Err(down())
        }
    }

    #[async_trait]
    impl StorageEngine for DownEngine {
        async fn begin(&self) -> Result<Box<dyn StorageTransaction>, EngineError> {
            Err(down())
        }
    }

    fn service_over(engine: Arc<dyn StorageEngine>) -> ChatService {
        let data = DataService::with_capabilities(engine, HashMap::new());
        ChatService::new(data, ProviderClient::new("http://localhost:1", "", 1))
    }

    fn row(v: Value) -> JsonMap {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn blocking_answer_survives_a_persistence_failure() {
        let chat = service_over(Arc::new(DownEngine));
        let response = ChatMessageResponse {
            conversation_id: "c1".to_string(),
            message_id: "m1".to_string(),
            answer: "hello [SEARCH_PARAMS] {\"a\":1}".to_string(),
            metadata: Value::Null,
            created_at: None,
        };

        let answer = chat.record_blocking_exchange("u1", "hi", response).await;
        assert_eq!(answer.answer, "hello");
        assert_eq!(answer.conversation_id, "c1");
        assert_eq!(answer.message_id, "m1");
    }

    #[tokio::test]
    async fn stopping_flags_only_the_streaming_answer() {
        let engine = MemoryEngine::new();
        engine
            .seed(
                "Message",
                vec![
                    row(json!({ "id": "t1", "status": "STREAMING" })),
                    row(json!({ "id": "t2", "status": "COMPLETED" })),
                ],
            )
            .await;
        let chat = service_over(Arc::new(engine.clone()));

        chat.mark_generation_stopped("t1").await;

        let messages = engine.table_snapshot("Message").await;
        assert_eq!(messages[0]["status"], json!("STOPPED"));
        assert_eq!(messages[1]["status"], json!("COMPLETED"));
    }

    #[test]
    fn clean_answer_strips_control_block() {
        let raw = "Here you go. [SEARCH_PARAMS] {\"city\":\"Oslo\",\"days\":3} Enjoy!";
        assert_eq!(clean_answer(raw), "Here you go.  Enjoy!");
    }

    #[test]
    fn clean_answer_handles_nested_and_string_braces() {
        let raw = "A [SEARCH_PARAMS] {\"f\":{\"g\":1},\"s\":\"a}b\"} B";
        assert_eq!(clean_answer(raw), "A  B");
    }

    #[test]
    fn clean_answer_without_block_is_trimmed_passthrough() {
        assert_eq!(clean_answer("  plain answer \n"), "plain answer");
    }

    #[test]
    fn clean_answer_drops_unterminated_block() {
        let raw = "Answer. [SEARCH_PARAMS] {\"broken\": tru";
        assert_eq!(clean_answer(raw), "Answer.");
    }

    #[test]
    fn clean_answer_strips_multiple_blocks() {
        let raw = "[SEARCH_PARAMS] {\"a\":1} mid [SEARCH_PARAMS] {\"b\":2} end";
        assert_eq!(clean_answer(raw), "mid  end");
    }

    #[test]
    fn clean_answer_strips_array_blocks() {
        let raw = "A [SEARCH_PARAMS] [{\"a\":1},{\"s\":\"]x\"}] B";
        assert_eq!(clean_answer(raw), "A  B");
    }

    #[test]
    fn clean_answer_collapses_blank_runs() {
        assert_eq!(clean_answer("Intro\n\n\n\nOutro"), "Intro\n\nOutro");
        // A single blank line is left alone.
        assert_eq!(clean_answer("one\n\ntwo"), "one\n\ntwo");
    }
}
