use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use parley_types::{Message, MessageRole};

/// Replaces assistant text that only echoes a function call.
pub const DEGENERATE_ECHO_FALLBACK: &str =
    "I'm sorry, I wasn't able to complete that request. Could you rephrase it or try again?";

/// Coerces null content on non-tool messages to `""`, strips template
/// tokens from assistant text, and collapses runs of assistant messages,
/// keeping the last one of each run.
pub fn sanitize_history(history: &mut Vec<Message>) {
    for message in history.iter_mut() {
        if message.role != MessageRole::Tool && message.content.is_none() {
            message.content = Some(String::new());
        }
        if message.role == MessageRole::Assistant {
            if let Some(content) = message.content.as_mut() {
                *content = strip_delimiter_tokens(content);
            }
        }
    }
    collapse_consecutive_assistants(history);
}

pub fn collapse_consecutive_assistants(history: &mut Vec<Message>) {
    let mut collapsed: Vec<Message> = Vec::with_capacity(history.len());
    for message in history.drain(..) {
        let previous_is_assistant = collapsed
            .last()
            .map(|prev| prev.role == MessageRole::Assistant)
            .unwrap_or(false);
        if previous_is_assistant && message.role == MessageRole::Assistant {
            collapsed.pop();
        }
        collapsed.push(message);
    }
    *history = collapsed;
}

fn delimiter_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"<\|[A-Za-z0-9_]+\|>|\[/?(?:TOOL_CALLS|INST|TOOL_RESULTS)\]|</?s>").ok()
        })
        .as_ref()
}

fn echo_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^functions\.[A-Za-z_][A-Za-z0-9_]*\s*\([^()]*\)\s*;?$",
            r"(?s)^<function=[^>]*>.*</function>$",
            r"(?s)^<function=[^>]*>\s*\{.*\}$",
            r"(?s)^<tool_call>.*</tool_call>$",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// `name({...})` where the parenthesized text is exactly one JSON object.
fn is_json_call_expression(content: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = PATTERN
        .get_or_init(|| {
            Regex::new(r"(?s)^(?:functions\.)?[A-Za-z_][A-Za-z0-9_]*\s*\((.*)\)\s*;?$").ok()
        })
        .as_ref()
    else {
        return false;
    };
    re.captures(content)
        .and_then(|caps| caps.get(1))
        .map(|inner| {
            matches!(
                serde_json::from_str::<Value>(inner.as_str().trim()),
                Ok(Value::Object(_))
            )
        })
        .unwrap_or(false)
}

/// Removes chat-template control tokens the backend sometimes leaks.
pub fn strip_delimiter_tokens(content: &str) -> String {
    match delimiter_pattern() {
        Some(re) => re.replace_all(content, "").trim().to_string(),
        None => content.trim().to_string(),
    }
}

/// Text that is nothing but a single function-call-looking expression.
pub fn is_degenerate_echo(content: &str) -> bool {
    let trimmed = content.trim();
    !trimmed.is_empty()
        && (is_json_call_expression(trimmed)
            || echo_patterns().iter().any(|re| re.is_match(trimmed)))
}

/// Delimiter stripping followed by echo detection.
pub fn clean_assistant_content(content: &str) -> String {
    let stripped = strip_delimiter_tokens(content);
    if is_degenerate_echo(&stripped) {
        tracing::warn!("assistant echoed a function call as text; replacing with fallback");
        return DEGENERATE_ECHO_FALLBACK.to_string();
    }
    stripped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(history: &[Message]) -> Vec<MessageRole> {
        history.iter().map(|m| m.role).collect()
    }

    #[test]
    fn null_content_becomes_empty_except_for_tool_messages() {
        let mut tool = Message::tool("call_1", "web_search", "x");
        tool.content = None;
        let mut user = Message::user("hi");
        user.content = None;
        let mut history = vec![user, tool];
        sanitize_history(&mut history);
        assert_eq!(history[0].content.as_deref(), Some(""));
        assert!(history[1].content.is_none());
    }

    #[test]
    fn assistant_template_tokens_are_stripped_from_history() {
        let mut history = vec![
            Message::user("<|im_start|>kept<|im_end|>"),
            Message::assistant("<|im_start|>earlier answer<|im_end|>"),
            Message::user("next"),
        ];
        sanitize_history(&mut history);
        assert_eq!(history[0].text(), "<|im_start|>kept<|im_end|>");
        assert_eq!(history[1].text(), "earlier answer");
    }

    #[test]
    fn assistant_runs_keep_the_latest_message() {
        let mut history = vec![
            Message::user("hi"),
            Message::assistant("first"),
            Message::assistant("second"),
            Message::assistant("third"),
            Message::user("again"),
            Message::assistant("fourth"),
        ];
        sanitize_history(&mut history);
        assert_eq!(
            roles(&history),
            vec![
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::User,
                MessageRole::Assistant
            ]
        );
        assert_eq!(history[1].text(), "third");
    }

    #[test]
    fn strips_template_tokens() {
        assert_eq!(
            strip_delimiter_tokens("<|im_start|>Hello there<|im_end|>"),
            "Hello there"
        );
        assert_eq!(strip_delimiter_tokens("[TOOL_CALLS] done </s>"), "done");
    }

    #[test]
    fn detects_echoed_function_calls() {
        assert!(is_degenerate_echo(r#"post_to_facebook({"message": "hi"})"#));
        assert!(is_degenerate_echo("functions.web_search(query=\"rust\")"));
        assert!(is_degenerate_echo("<function=web_search>{\"query\":\"x\"}</function>"));
        assert!(is_degenerate_echo("<tool_call>{\"name\":\"x\"}</tool_call>"));
        assert!(is_degenerate_echo("<function=get_page_posts>{}"));
        assert!(!is_degenerate_echo("The weather is nice (mostly)."));
        assert!(!is_degenerate_echo(
            "Wrap each call in <tool_call> tags when you reply; the model will see it."
        ));
        assert!(!is_degenerate_echo(
            "functions.map(f) applies f to every element (see chapter 3)"
        ));
        assert!(!is_degenerate_echo("Use <function=web_search> to look things up."));
        assert!(!is_degenerate_echo(r#"post({"a": 1}) then wait ({"b": 2})"#));
        assert!(!is_degenerate_echo(
            "ACTION: web_search\nPARAMETERS:\nquery=rust\nEXPLANATION: go"
        ));
    }

    #[test]
    fn clean_content_replaces_echo_with_fallback() {
        assert_eq!(
            clean_assistant_content("<|eot_id|>get_page_posts({})"),
            DEGENERATE_ECHO_FALLBACK
        );
        assert_eq!(clean_assistant_content(" plain answer "), "plain answer");
    }
}
