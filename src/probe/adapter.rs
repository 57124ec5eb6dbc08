use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde_json::{Value, json};

use crate::storage::EndpointKind;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
const PREVIEW_MAX_LEN: usize = 500;

/// Canonical upstream path for an endpoint kind, appended to the normalized
/// channel base URL.
pub fn endpoint_path(endpoint: EndpointKind, model: &str, stream: bool) -> String {
    match endpoint {
        EndpointKind::Chat => "/v1/chat/completions".to_string(),
        EndpointKind::Claude => "/v1/messages".to_string(),
        EndpointKind::Codex => "/v1/responses".to_string(),
        EndpointKind::Image => "/v1/images/generations".to_string(),
        EndpointKind::Gemini => {
            let action = if stream {
                "streamGenerateContent"
            } else {
                "generateContent"
            };
            format!("/v1beta/models/{model}:{action}")
        }
    }
}

/// Auth and protocol headers for an endpoint kind. Each protocol has a fixed
/// header set; nothing from the inbound request leaks through except the
/// Anthropic version/beta headers the caller may pass along.
pub fn endpoint_headers(endpoint: EndpointKind, api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    match endpoint {
        EndpointKind::Chat | EndpointKind::Codex | EndpointKind::Image => {
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
                headers.insert(AUTHORIZATION, v);
            }
        }
        EndpointKind::Claude => {
            if let Ok(v) = HeaderValue::from_str(api_key) {
                headers.insert(HeaderName::from_static("x-api-key"), v);
            }
            headers.insert(
                HeaderName::from_static("anthropic-version"),
                HeaderValue::from_static(ANTHROPIC_VERSION),
            );
        }
        EndpointKind::Gemini => {
            if let Ok(v) = HeaderValue::from_str(api_key) {
                headers.insert(HeaderName::from_static("x-goog-api-key"), v);
            }
        }
    }
    headers
}

/// Minimal probe body for an endpoint kind.
pub fn probe_body(endpoint: EndpointKind, model: &str, prompt: &str) -> Bytes {
    let body = match endpoint {
        EndpointKind::Chat => json!({
            "model": model,
            "max_tokens": 50,
            "stream": false,
            "messages": [{"role": "user", "content": prompt}],
        }),
        EndpointKind::Claude => json!({
            "model": model,
            "max_tokens": 50,
            "stream": false,
            "messages": [{"role": "user", "content": prompt}],
        }),
        EndpointKind::Gemini => json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {"maxOutputTokens": 10},
        }),
        EndpointKind::Codex => json!({
            "model": model,
            "stream": false,
            "input": [{"role": "user", "content": [{"type": "input_text", "text": prompt}]}],
        }),
        EndpointKind::Image => json!({
            "model": model,
            "prompt": prompt,
            "n": 1,
            "size": "256x256",
        }),
    };
    Bytes::from(body.to_string())
}

/// Some gateways answer HTTP 200 with an error payload. Any of the four
/// recognized shapes downgrades the probe to a failure.
pub fn body_error_message(v: &Value) -> Option<String> {
    if let Some(error) = v.get("error") {
        match error {
            Value::String(s) if !s.trim().is_empty() => return Some(s.clone()),
            Value::Object(obj) => {
                if let Some(message) = obj.get("message").and_then(Value::as_str) {
                    return Some(message.to_string());
                }
                return Some(error.to_string());
            }
            _ => {}
        }
    }

    if v.get("success") == Some(&Value::Bool(false)) {
        let message = v
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("success=false");
        return Some(message.to_string());
    }

    if let Some(code) = v.get("code").and_then(Value::as_i64)
        && code != 0
        && let Some(message) = v.get("message").and_then(Value::as_str)
    {
        return Some(format!("[{code}] {message}"));
    }

    if let Some(status) = v.get("status").and_then(Value::as_str)
        && matches!(status, "error" | "fail" | "failed")
    {
        let message = v.get("message").and_then(Value::as_str).unwrap_or(status);
        return Some(message.to_string());
    }

    None
}

/// Human-readable response excerpt per endpoint kind, truncated to 500
/// chars with reasoning sentinels removed.
pub fn response_preview(endpoint: EndpointKind, v: &Value) -> Option<String> {
    let raw = match endpoint {
        EndpointKind::Chat => chat_preview(v),
        EndpointKind::Claude => claude_preview(v),
        EndpointKind::Gemini => gemini_preview(v),
        EndpointKind::Codex => codex_preview(v),
        EndpointKind::Image => image_preview(v),
    }?;
    let cleaned = strip_think(&raw);
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }
    Some(truncate_chars(cleaned, PREVIEW_MAX_LEN))
}

fn chat_preview(v: &Value) -> Option<String> {
    let choice = v.get("choices")?.get(0)?;
    if let Some(message) = choice.get("message") {
        for field in ["content", "reasoning_content", "refusal"] {
            if let Some(text) = message.get(field).and_then(Value::as_str)
                && !text.is_empty()
            {
                return Some(text.to_string());
            }
        }
    }
    if let Some(text) = choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
    {
        return Some(text.to_string());
    }
    choice
        .get("text")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn claude_preview(v: &Value) -> Option<String> {
    let blocks = v.get("content")?.as_array()?;
    blocks
        .iter()
        .find(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .and_then(|b| b.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn gemini_preview(v: &Value) -> Option<String> {
    let parts = v
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;

    // Prefer a non-thought part; a thinking-only answer is still a preview.
    let answer = parts.iter().find(|p| {
        p.get("text").is_some() && p.get("thought").and_then(Value::as_bool) != Some(true)
    });
    answer
        .or_else(|| parts.iter().find(|p| p.get("text").is_some()))
        .and_then(|p| p.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn codex_preview(v: &Value) -> Option<String> {
    let output = v.get("output")?.as_array()?;
    for item in output {
        if let Some(content) = item.get("content").and_then(Value::as_array) {
            for block in content {
                if block.get("type").and_then(Value::as_str) == Some("output_text")
                    && let Some(text) = block.get("text").and_then(Value::as_str)
                {
                    return Some(text.to_string());
                }
            }
        }
    }
    output
        .iter()
        .find_map(|item| item.get("text").and_then(Value::as_str))
        .map(str::to_string)
}

fn image_preview(v: &Value) -> Option<String> {
    let first = v.get("data")?.get(0)?;
    let mut parts = Vec::new();
    if let Some(url) = first.get("url").and_then(Value::as_str) {
        parts.push(format!("url={url}"));
    }
    if first.get("b64_json").and_then(Value::as_str).is_some() {
        parts.push("b64_json=<inline image>".to_string());
    }
    if let Some(revised) = first.get("revised_prompt").and_then(Value::as_str) {
        parts.push(format!("revised_prompt={revised}"));
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join(" "))
}

/// An IMAGE probe succeeds iff the response carries an image reference.
pub fn image_response_ok(v: &Value) -> bool {
    v.get("data")
        .and_then(|d| d.get(0))
        .is_some_and(|first| {
            first.get("url").and_then(Value::as_str).is_some()
                || first.get("b64_json").and_then(Value::as_str).is_some()
        })
}

/// Remove `<think>…</think>` spans that reasoning models interleave with
/// the answer text.
pub fn strip_think(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find("<think>") {
            Some(start) => {
                out.push_str(&rest[..start]);
                let after = &rest[start + "<think>".len()..];
                match after.find("</think>") {
                    Some(end) => rest = &after[end + "</think>".len()..],
                    None => break,
                }
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    out
}

fn truncate_chars(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut out = String::with_capacity(max_len + 1);
    let keep = max_len.saturating_sub(1);
    for ch in s.chars() {
        if out.len() + ch.len_utf8() > keep {
            break;
        }
        out.push(ch);
    }
    out.push('…');
    out
}

/// Parse an OpenAI-style model listing (`data[].id`).
pub fn parse_model_list(body: &[u8]) -> anyhow::Result<Vec<String>> {
    let v: Value = serde_json::from_slice(body)?;
    let data = v
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow::anyhow!("model list response 缺少 data 数组"))?;

    Ok(data
        .iter()
        .filter_map(|item| item.get("id").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_preview_prefers_message_content() {
        let v = json!({"choices": [{"message": {"content": "yes", "reasoning_content": "hm"}}]});
        assert_eq!(response_preview(EndpointKind::Chat, &v).unwrap(), "yes");
    }

    #[test]
    fn chat_preview_falls_back_to_delta() {
        let v = json!({"choices": [{"delta": {"content": "partial"}}]});
        assert_eq!(
            response_preview(EndpointKind::Chat, &v).unwrap(),
            "partial"
        );
    }

    #[test]
    fn think_blocks_are_stripped() {
        let v = json!({"choices": [{"message": {"content": "<think>internal</think>no"}}]});
        assert_eq!(response_preview(EndpointKind::Chat, &v).unwrap(), "no");
    }

    #[test]
    fn claude_preview_finds_first_text_block() {
        let v = json!({"content": [
            {"type": "thinking", "thinking": "…"},
            {"type": "text", "text": "yes"},
        ]});
        assert_eq!(response_preview(EndpointKind::Claude, &v).unwrap(), "yes");
    }

    #[test]
    fn gemini_preview_skips_thought_parts() {
        let v = json!({"candidates": [{"content": {"parts": [
            {"text": "thinking…", "thought": true},
            {"text": "yes"},
        ]}}]});
        assert_eq!(response_preview(EndpointKind::Gemini, &v).unwrap(), "yes");
    }

    #[test]
    fn codex_preview_reads_output_text() {
        let v = json!({"output": [
            {"type": "reasoning", "content": []},
            {"type": "message", "content": [{"type": "output_text", "text": "yes"}]},
        ]});
        assert_eq!(response_preview(EndpointKind::Codex, &v).unwrap(), "yes");
    }

    #[test]
    fn body_error_shapes() {
        assert_eq!(
            body_error_message(&json!({"error": {"message": "quota exceeded"}})).unwrap(),
            "quota exceeded"
        );
        assert_eq!(
            body_error_message(&json!({"error": "boom"})).unwrap(),
            "boom"
        );
        assert_eq!(
            body_error_message(&json!({"success": false, "message": "nope"})).unwrap(),
            "nope"
        );
        assert_eq!(
            body_error_message(&json!({"code": 1302, "message": "balance"})).unwrap(),
            "[1302] balance"
        );
        assert_eq!(
            body_error_message(&json!({"status": "failed", "message": "later"})).unwrap(),
            "later"
        );
        assert!(body_error_message(&json!({"code": 0, "message": "ok"})).is_none());
        assert!(body_error_message(&json!({"choices": []})).is_none());
    }

    #[test]
    fn gemini_paths_carry_the_action() {
        assert_eq!(
            endpoint_path(EndpointKind::Gemini, "gemini-2.0-flash", false),
            "/v1beta/models/gemini-2.0-flash:generateContent"
        );
        assert_eq!(
            endpoint_path(EndpointKind::Gemini, "gemini-2.0-flash", true),
            "/v1beta/models/gemini-2.0-flash:streamGenerateContent"
        );
    }

    #[test]
    fn model_list_parsing() {
        let body = br#"{"object":"list","data":[{"id":"gpt-4o"},{"id":"o3-mini"}]}"#;
        assert_eq!(parse_model_list(body).unwrap(), vec!["gpt-4o", "o3-mini"]);
    }

    #[test]
    fn image_ok_requires_payload() {
        assert!(image_response_ok(&json!({"data": [{"url": "https://img"}]})));
        assert!(image_response_ok(&json!({"data": [{"b64_json": "aaaa"}]})));
        assert!(!image_response_ok(&json!({"data": []})));
        assert!(!image_response_ok(&json!({"created": 1})));
    }
}
