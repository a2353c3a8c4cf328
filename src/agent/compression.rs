//! Context compression for message lists that exceed the configured token budget.
//!
//! Token counts are estimated as `len(text) / 4` rounded up, matching the
//! cheap heuristic providers without a native tokenizer fall back to.

use serde::{Deserialize, Serialize};

use crate::providers::{ChatMessage, Provider, Role};
use crate::util::truncate_with_ellipsis;

/// Selected strategy for shrinking an over-budget message list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStrategy {
    /// Summarize the oldest messages into one system message, keeping the
    /// most recent `keep_recent` messages verbatim.
    Window,
    /// Drop the oldest non-system messages until the list fits, with no
    /// summarization call.
    Truncate,
    /// Summarize the entire non-system history into a single system message.
    Summarize,
}

const MAX_SOURCE_CHARS: usize = 12_000;
const MAX_SUMMARY_CHARS: usize = 2_000;

/// Estimate the token count of a message list as `len(text) / 4` rounded up.
pub fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    let chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
    chars.div_ceil(4)
}

fn system_prefix_len(messages: &[ChatMessage]) -> usize {
    usize::from(messages.first().is_some_and(|m| m.role == Role::System))
}

fn build_transcript(messages: &[ChatMessage]) -> String {
    let mut transcript = String::new();
    for msg in messages {
        transcript.push_str(&format!("{:?}: {}\n", msg.role, msg.content.trim()));
    }
    if transcript.chars().count() > MAX_SOURCE_CHARS {
        truncate_with_ellipsis(&transcript, MAX_SOURCE_CHARS)
    } else {
        transcript
    }
}

async fn summarize(provider: &dyn Provider, model: &str, transcript: &str) -> String {
    let system = "You are a conversation compaction engine. Summarize older chat \
history into concise context for future turns. Preserve: user preferences, \
commitments, decisions, unresolved tasks, key facts. Omit: filler, repeated \
chit-chat, verbose tool logs. Output plain text bullet points only.";
    let user = format!(
        "Summarize the following conversation history for context preservation. \
Keep it short (max 12 bullet points).\n\n{transcript}"
    );

    let raw = provider
        .chat_with_system(Some(system), &user, model, 0.2)
        .await
        .unwrap_or_else(|_| truncate_with_ellipsis(transcript, MAX_SUMMARY_CHARS));

    truncate_with_ellipsis(&raw, MAX_SUMMARY_CHARS)
}

/// Compress `messages` in place if it is reported as over budget by the
/// caller. Returns `true` if a compression pass ran.
///
/// `keep_recent` only affects [`CompressionStrategy::Window`]; the other two
/// strategies ignore it.
pub async fn compress(
    messages: &mut Vec<ChatMessage>,
    strategy: CompressionStrategy,
    keep_recent: usize,
    provider: &dyn Provider,
    model: &str,
) -> bool {
    let start = system_prefix_len(messages);
    let non_system = messages.len() - start;
    if non_system == 0 {
        return false;
    }

    match strategy {
        CompressionStrategy::Truncate => {
            let keep = keep_recent.min(non_system);
            let drop_count = non_system - keep;
            if drop_count == 0 {
                return false;
            }
            messages.drain(start..start + drop_count);
            true
        }
        CompressionStrategy::Window => {
            let keep = keep_recent.min(non_system);
            let compact_count = non_system - keep;
            if compact_count == 0 {
                return false;
            }
            let compact_end = start + compact_count;
            let transcript = build_transcript(&messages[start..compact_end]);
            let summary = summarize(provider, model, &transcript).await;
            let summary_msg =
                ChatMessage::assistant(format!("[Compaction summary]\n{}", summary.trim()));
            messages.splice(start..compact_end, std::iter::once(summary_msg));
            true
        }
        CompressionStrategy::Summarize => {
            let transcript = build_transcript(&messages[start..]);
            let summary = summarize(provider, model, &transcript).await;
            let summary_msg =
                ChatMessage::assistant(format!("[Compaction summary]\n{}", summary.trim()));
            messages.splice(start.., std::iter::once(summary_msg));
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        async fn chat_with_system(
            &self,
            _system_prompt: Option<&str>,
            _message: &str,
            _model: &str,
            _temperature: f64,
        ) -> anyhow::Result<String> {
            Ok("- summary bullet one\n- summary bullet two".to_string())
        }
    }

    fn history(n: usize) -> Vec<ChatMessage> {
        let mut msgs = vec![ChatMessage::system("you are a bot")];
        for i in 0..n {
            msgs.push(ChatMessage::user(format!("message {i}")));
        }
        msgs
    }

    #[test]
    fn estimate_tokens_divides_by_four_rounding_up() {
        let msgs = vec![ChatMessage::user("a".repeat(10))];
        assert_eq!(estimate_tokens(&msgs), 3);
    }

    #[tokio::test]
    async fn truncate_drops_oldest_non_system_messages() {
        let mut msgs = history(10);
        let provider = EchoProvider;
        let changed = compress(&mut msgs, CompressionStrategy::Truncate, 3, &provider, "m").await;

        assert!(changed);
        assert_eq!(msgs.len(), 1 + 3);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs.last().unwrap().content, "message 9");
    }

    #[tokio::test]
    async fn truncate_is_noop_when_already_within_keep_recent() {
        let mut msgs = history(2);
        let provider = EchoProvider;
        let changed = compress(&mut msgs, CompressionStrategy::Truncate, 5, &provider, "m").await;

        assert!(!changed);
        assert_eq!(msgs.len(), 3);
    }

    #[tokio::test]
    async fn window_keeps_recent_and_summarizes_prefix() {
        let mut msgs = history(10);
        let provider = EchoProvider;
        let changed = compress(&mut msgs, CompressionStrategy::Window, 3, &provider, "m").await;

        assert!(changed);
        // system + 1 summary message + 3 kept recent
        assert_eq!(msgs.len(), 1 + 1 + 3);
        assert!(msgs[1].content.contains("Compaction summary"));
        assert_eq!(msgs.last().unwrap().content, "message 9");
    }

    #[tokio::test]
    async fn summarize_collapses_entire_non_system_history() {
        let mut msgs = history(10);
        let provider = EchoProvider;
        let changed =
            compress(&mut msgs, CompressionStrategy::Summarize, 0, &provider, "m").await;

        assert!(changed);
        assert_eq!(msgs.len(), 2);
        assert!(msgs[1].content.contains("Compaction summary"));
    }

    #[tokio::test]
    async fn compress_is_noop_with_no_non_system_messages() {
        let mut msgs = vec![ChatMessage::system("only system")];
        let provider = EchoProvider;
        let changed = compress(&mut msgs, CompressionStrategy::Summarize, 0, &provider, "m").await;

        assert!(!changed);
        assert_eq!(msgs.len(), 1);
    }
}
