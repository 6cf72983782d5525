//! Compaction Engine driver (C5, §4.5): wires the pure selection/prompt
//! helpers in `nexus3_context::compaction` to a live, single non-streaming
//! provider call and Session Storage. The helpers themselves stay
//! provider- and storage-agnostic; this module is the "caller" their doc
//! comments refer to. Splicing the result into the live `ContextManager`
//! is left to the caller (`Session::compact`) so this function never needs
//! to hold a Context lock across its `.await` points.

use nexus3_context::compaction::{
    build_summarize_prompt, create_summary_message, select_messages_for_compaction, CompactionResult,
};
use nexus3_context::token_counter::TokenCounter;
use nexus3_core::types::Message;
use nexus3_llm::provider::{LlmProvider, LlmRequest};

use crate::error::{Result, SessionError};
use crate::storage::{MessageRow, SessionStorage};

/// Token budget for the summarization call itself — generous enough for a
/// multi-paragraph summary without risking a runaway response.
const SUMMARY_MAX_TOKENS: u32 = 1024;

fn row_to_message(row: &MessageRow) -> Message {
    Message {
        role: row.role,
        content: row.content.clone(),
        tool_calls: row.tool_calls.clone(),
        tool_call_id: row.tool_call_id.clone(),
    }
}

fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Runs one compaction pass (§4.5 steps 1-6) against Storage's in-context
/// rows, which are the authoritative, id-bearing source of what's live.
/// Deliberately takes the token counter and budget by value rather than a
/// live `&ContextManager` borrow, since this spans several `.await` points
/// (a storage round-trip and a provider call) and a caller holding a
/// Context lock across all of that would block every other reader for the
/// duration.
///
/// 1-2. Selects a newest-first preserved set under `preserve_ratio` of
///    `budget`; everything older becomes `to_summarize`.
/// 3. Builds the redacted summarization prompt.
/// 4. Invokes `provider.complete_once` (non-streaming).
/// 5. Wraps the result in a synthetic `[CONTEXT SUMMARY - ...]` message.
/// 6. Marks the replaced rows out-of-context in `storage`, atomically
///    recording the summary row's `summary_of`. The caller is responsible
///    for splicing the returned `CompactionResult` into its Context (see
///    `Session::compact`), since this function never touches Context
///    directly.
///
/// Returns `Ok(None)` when there is nothing worth summarizing (empty
/// in-context history, or every message already fits the preserve budget).
pub async fn run_compaction(
    provider: &dyn LlmProvider,
    model: &str,
    storage: &SessionStorage,
    counter: &dyn TokenCounter,
    budget: usize,
    preserve_ratio: f64,
) -> Result<Option<CompactionResult>> {
    let rows = storage.get_messages(true).await?;
    if rows.is_empty() {
        return Ok(None);
    }

    let messages: Vec<Message> = rows.iter().map(row_to_message).collect();

    let (to_summarize, preserved) = select_messages_for_compaction(&messages, counter, budget, preserve_ratio);
    if to_summarize.is_empty() {
        return Ok(None);
    }

    let prompt = build_summarize_prompt(&to_summarize);
    let request = LlmRequest {
        model: model.to_string(),
        messages: vec![Message::user(prompt)],
        tools: vec![],
        max_tokens: SUMMARY_MAX_TOKENS,
        temperature: None,
        stream: false,
    };
    let summary_text = provider
        .complete_once(request)
        .await
        .map_err(|e| SessionError::Persistence(format!("compaction summarization call failed: {e}")))?;
    let summary_message = create_summary_message(&summary_text);

    let original_token_count = counter.count_messages(&messages);
    let new_token_count = counter.count_messages(&preserved) + counter.count(&summary_message.content);

    // The selection above always splits the id-ordered row list as a
    // contiguous oldest prefix (to_summarize) + newest suffix (preserved),
    // so the same split point on `rows` identifies exactly the rows that
    // were summarized versus kept.
    let split = rows.len() - preserved.len();
    let replaced_ids: Vec<i64> = rows[..split].iter().map(|r| r.id).collect();

    let summary_tokens = counter.count(&summary_message.content) as i64;
    let summary_id = storage
        .insert_message(
            summary_message.role,
            &summary_message.content,
            None,
            None,
            &[],
            summary_tokens,
            unix_timestamp(),
        )
        .await?;
    storage.mark_as_summary(summary_id, &replaced_ids).await?;

    Ok(Some(CompactionResult {
        summary_message,
        preserved_messages: preserved,
        original_token_count,
        new_token_count,
    }))
}
