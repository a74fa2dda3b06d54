//! Extraction of structured payloads from model output.
//!
//! Models wrap their JSON in code fences, prefix it with prose, or emit
//! several fragments in one reply. Parsing here is permissive on framing
//! (any balanced JSON object found anywhere in the text is a candidate)
//! and strict on content: candidates must parse, and callers validate the
//! fields they need.

use crate::parley::central::ToolInvocation;

/// Scan `text` for balanced JSON objects, in order of appearance.
///
/// Brace matching is string-aware (braces inside JSON string literals do
/// not count), so payloads whose values contain `{` or `}` survive. A
/// candidate that does not parse as a JSON object is skipped and the scan
/// continues from its opening brace.
pub fn json_objects(text: &str) -> Vec<serde_json::Value> {
    let bytes = text.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        match balanced_end(bytes, i) {
            Some(end) => {
                let candidate = &text[i..end];
                match serde_json::from_str::<serde_json::Value>(candidate) {
                    Ok(value) if value.is_object() => {
                        found.push(value);
                        i = end;
                    }
                    _ => i += 1,
                }
            }
            None => i += 1,
        }
    }
    found
}

/// Index one past the brace matching the `{` at `start`, tracking string
/// literals and escapes.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// The first JSON object in `text` that deserialises into `T`.
///
/// This is the workhorse for skill output: it tolerates fences and
/// surrounding prose, but the payload itself must satisfy `T`'s schema.
pub fn first_object_as<T: serde::de::DeserializeOwned>(text: &str) -> Option<T> {
    json_objects(text)
        .into_iter()
        .find_map(|value| serde_json::from_value(value).ok())
}

/// Every `{"tool": {"name": ..., "arguments": ...}}` fragment in `text`,
/// in order of appearance. Absent `arguments` defaults to `{}`: an empty
/// argument object is a valid value, distinct from a missing tool name.
pub fn tool_invocations(text: &str) -> Vec<ToolInvocation> {
    json_objects(text)
        .into_iter()
        .filter_map(|value| {
            let tool = value.get("tool")?;
            let name = tool.get("name")?.as_str()?.to_string();
            let arguments = tool
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));
            Some(ToolInvocation { name, arguments })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_object_inside_code_fence() {
        let text = "Here you go:\n```json\n{\"intent\": \"hire a team\"}\n```\nHope that helps!";
        let objects = json_objects(text);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["intent"], "hire a team");
    }

    #[test]
    fn braces_inside_strings_do_not_break_matching() {
        let text = r#"{"note": "a { tricky } value", "ok": true}"#;
        let objects = json_objects(text);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["ok"], true);
    }

    #[test]
    fn skips_unparseable_candidates() {
        let text = "set {a, b} then {\"valid\": 1}";
        let objects = json_objects(text);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0]["valid"], 1);
    }

    #[test]
    fn extracts_multiple_tool_fragments_in_order() {
        let text = r#"
            I'll ask both agents.
            {"tool": {"name": "ask_agent", "arguments": {"agent_id": "alice", "question": "When?"}}}
            {"tool": {"name": "ask_agent", "arguments": {"agent_id": "bob", "question": "Where?"}}}
        "#;
        let calls = tool_invocations(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments["agent_id"], "alice");
        assert_eq!(calls[1].arguments["agent_id"], "bob");
    }

    #[test]
    fn missing_arguments_default_to_empty_object() {
        let calls = tool_invocations(r#"{"tool": {"name": "output_plan"}}"#);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].arguments.as_object().unwrap().is_empty());
    }

    #[test]
    fn nested_tool_free_objects_are_ignored() {
        let calls = tool_invocations(r#"{"plan": {"summary": "no tools here"}}"#);
        assert!(calls.is_empty());
    }
}
