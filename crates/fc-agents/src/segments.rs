use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A parsed tool invocation request extracted from model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    pub args: serde_json::Value,
}

/// Model output decomposed into typed segments. Downstream consumers
/// subscribe to `Answer` and `ToolCall`; `Think` is never executed.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Think(String),
    Answer(String),
    ToolCall(ToolCallRequest),
}

// ---------------------------------------------------------------------------
// Segmentation
// ---------------------------------------------------------------------------

/// Split a model response into think / answer / tool-call segments.
///
/// Two tool-call envelopes are accepted:
///
/// 1. An XML-like block: `<tool_use>{"name": ..., "args": {...}}</tool_use>`
/// 2. A `function:` line followed by a fenced JSON block.
///
/// Parsing is lenient: unknown keys are ignored, trailing commas repaired,
/// multiple calls extracted in order. Anything inside `<think>` regions is
/// preserved as `Think` and never parsed for calls.
pub fn segment_response(text: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    for (is_think, region) in split_think_regions(text) {
        if is_think {
            if !region.trim().is_empty() {
                segments.push(Segment::Think(region));
            }
        } else {
            extract_from_answer(&region, &mut segments);
        }
    }
    segments
}

/// All tool calls, in order, from a segment list.
pub fn tool_calls(segments: &[Segment]) -> Vec<ToolCallRequest> {
    segments
        .iter()
        .filter_map(|s| match s {
            Segment::ToolCall(call) => Some(call.clone()),
            _ => None,
        })
        .collect()
}

/// The concatenated answer text from a segment list.
pub fn answer_text(segments: &[Segment]) -> String {
    segments
        .iter()
        .filter_map(|s| match s {
            Segment::Answer(text) => Some(text.trim()),
            _ => None,
        })
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Think regions
// ---------------------------------------------------------------------------

fn split_think_regions(text: &str) -> Vec<(bool, String)> {
    let mut out = Vec::new();
    let mut rest = text;
    loop {
        let Some((open_tag, close_tag, start)) = find_think_open(rest) else {
            if !rest.is_empty() {
                out.push((false, rest.to_string()));
            }
            return out;
        };
        if start > 0 {
            out.push((false, rest[..start].to_string()));
        }
        let after_open = &rest[start + open_tag.len()..];
        match after_open.find(close_tag) {
            Some(end) => {
                out.push((true, after_open[..end].to_string()));
                rest = &after_open[end + close_tag.len()..];
            }
            None => {
                // Unterminated think block swallows the remainder.
                out.push((true, after_open.to_string()));
                return out;
            }
        }
    }
}

fn find_think_open(text: &str) -> Option<(&'static str, &'static str, usize)> {
    let candidates = [("<think>", "</think>"), ("<thinking>", "</thinking>")];
    candidates
        .iter()
        .filter_map(|(open, close)| text.find(open).map(|pos| (*open, *close, pos)))
        .min_by_key(|(_, _, pos)| *pos)
}

// ---------------------------------------------------------------------------
// Envelope extraction
// ---------------------------------------------------------------------------

fn extract_from_answer(region: &str, segments: &mut Vec<Segment>) {
    let mut rest = region;
    loop {
        let xml = rest.find("<tool_use>");
        let func = find_function_envelope(rest);
        let func_pos = func.as_ref().map(|(pos, _, _)| *pos);

        match (xml, func_pos) {
            (None, None) => {
                if !rest.trim().is_empty() {
                    segments.push(Segment::Answer(rest.to_string()));
                }
                return;
            }
            (Some(xml_pos), Some(f_pos)) if f_pos < xml_pos => {
                rest = consume_function(rest, func, segments);
            }
            (Some(xml_pos), _) => {
                rest = consume_xml(rest, xml_pos, segments);
            }
            (None, Some(_)) => {
                rest = consume_function(rest, func, segments);
            }
        }
    }
}

fn consume_xml<'a>(rest: &'a str, pos: usize, segments: &mut Vec<Segment>) -> &'a str {
    if !rest[..pos].trim().is_empty() {
        segments.push(Segment::Answer(rest[..pos].to_string()));
    }
    let after_open = &rest[pos + "<tool_use>".len()..];
    match after_open.find("</tool_use>") {
        Some(end) => {
            let body = &after_open[..end];
            match parse_call_json(body) {
                Some(call) => segments.push(Segment::ToolCall(call)),
                None => debug!("ignoring unparseable tool_use envelope"),
            }
            &after_open[end + "</tool_use>".len()..]
        }
        None => {
            debug!("ignoring unterminated tool_use envelope");
            ""
        }
    }
}

/// Find `function: NAME` followed by a fenced JSON block. Returns
/// (start, name, span_end).
fn find_function_envelope(text: &str) -> Option<(usize, String, usize)> {
    let pos = text.find("function:")?;
    let after = &text[pos + "function:".len()..];
    let line_end = after.find('\n').unwrap_or(after.len());
    let name = after[..line_end].trim().to_string();
    if name.is_empty() || name.contains(' ') {
        return None;
    }
    let fence_region = &after[line_end..];
    let fence_start = fence_region.find("```")?;
    let after_fence = &fence_region[fence_start + 3..];
    // Skip an optional language tag on the fence line.
    let body_start = after_fence.find('\n')? + 1;
    let body_region = &after_fence[body_start..];
    let fence_close = body_region.find("```")?;
    let span_end = pos
        + "function:".len()
        + line_end
        + fence_start
        + 3
        + body_start
        + fence_close
        + 3;
    Some((pos, name, span_end))
}

fn consume_function<'a>(
    rest: &'a str,
    envelope: Option<(usize, String, usize)>,
    segments: &mut Vec<Segment>,
) -> &'a str {
    let Some((pos, name, span_end)) = envelope else {
        return "";
    };
    if !rest[..pos].trim().is_empty() {
        segments.push(Segment::Answer(rest[..pos].to_string()));
    }
    // Re-locate the JSON body inside the envelope span.
    let span = &rest[pos..span_end];
    let args = span
        .find("```")
        .and_then(|fence| {
            let after = &span[fence + 3..];
            let body_start = after.find('\n')? + 1;
            let body = &after[body_start..];
            let close = body.find("```")?;
            parse_lenient_json(&body[..close])
        })
        .unwrap_or(serde_json::Value::Null);

    if args.is_null() {
        debug!(name, "ignoring function envelope with unparseable body");
    } else {
        segments.push(Segment::ToolCall(ToolCallRequest { name, args }));
    }
    &rest[span_end..]
}

// ---------------------------------------------------------------------------
// Lenient JSON
// ---------------------------------------------------------------------------

fn parse_call_json(body: &str) -> Option<ToolCallRequest> {
    let value = parse_lenient_json(body)?;
    let name = value
        .get("name")
        .or_else(|| value.get("tool"))
        .and_then(|v| v.as_str())?
        .to_string();
    let args = value
        .get("args")
        .or_else(|| value.get("input"))
        .or_else(|| value.get("arguments"))
        .or_else(|| value.get("parameters"))
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));
    Some(ToolCallRequest { name, args })
}

/// Parse JSON, repairing trailing commas before `}` and `]`.
fn parse_lenient_json(raw: &str) -> Option<serde_json::Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let repaired = strip_trailing_commas(trimmed);
    serde_json::from_str(&repaired).ok()
}

fn strip_trailing_commas(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = raw.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        if in_string {
            out.push(*c);
            if escaped {
                escaped = false;
            } else if *c == '\\' {
                escaped = true;
            } else if *c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push('"');
            }
            ',' => {
                let next_meaningful = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if matches!(next_meaningful, Some('}') | Some(']')) {
                    continue;
                }
                out.push(',');
            }
            other => out.push(*other),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_text_is_one_answer_segment() {
        let segments = segment_response("The answer is 42.");
        assert_eq!(segments, vec![Segment::Answer("The answer is 42.".into())]);
        assert!(tool_calls(&segments).is_empty());
    }

    #[test]
    fn xml_envelope_is_extracted() {
        let text = r#"Let me read that.
<tool_use>{"name": "read_file", "args": {"path": "package.json"}}</tool_use>"#;
        let segments = segment_response(text);
        let calls = tool_calls(&segments);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].args, json!({"path": "package.json"}));
        assert_eq!(answer_text(&segments), "Let me read that.");
    }

    #[test]
    fn function_envelope_is_extracted() {
        let text = "I'll search.\nfunction: web_search\n```json\n{\"query\": \"Bitcoin price\"}\n```\ndone";
        let calls = tool_calls(&segment_response(text));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "web_search");
        assert_eq!(calls[0].args, json!({"query": "Bitcoin price"}));
    }

    #[test]
    fn multiple_calls_keep_order() {
        let text = r#"<tool_use>{"name": "read_file", "args": {"path": "a"}}</tool_use>
then
<tool_use>{"name": "write_file", "args": {"path": "b", "content": "c"}}</tool_use>"#;
        let calls = tool_calls(&segment_response(text));
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[1].name, "write_file");
    }

    #[test]
    fn trailing_commas_are_repaired() {
        let text = r#"<tool_use>{"name": "read_file", "args": {"path": "a.txt",},}</tool_use>"#;
        let calls = tool_calls(&segment_response(text));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args, json!({"path": "a.txt"}));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let text = r#"<tool_use>{"name": "read_file", "input": {"path": "x"}, "confidence": 0.9}</tool_use>"#;
        let calls = tool_calls(&segment_response(text));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args, json!({"path": "x"}));
    }

    #[test]
    fn calls_inside_think_are_never_extracted() {
        let text = r#"<think>maybe I should
<tool_use>{"name": "shell", "args": {"command": "rm -rf /"}}</tool_use>
no.</think>The safe answer."#;
        let segments = segment_response(text);
        assert!(tool_calls(&segments).is_empty());
        assert_eq!(answer_text(&segments), "The safe answer.");
        assert!(matches!(segments[0], Segment::Think(_)));
    }

    #[test]
    fn thinking_tag_variant_is_recognized() {
        let segments = segment_response("<thinking>hmm</thinking>yes");
        assert_eq!(segments.len(), 2);
        assert_eq!(answer_text(&segments), "yes");
    }

    #[test]
    fn unterminated_think_swallows_remainder() {
        let segments =
            segment_response("<think>never closed <tool_use>{\"name\":\"x\"}</tool_use>");
        assert!(tool_calls(&segments).is_empty());
    }

    #[test]
    fn unparseable_envelope_is_ignored_not_guessed() {
        let text = "before <tool_use>this is not json</tool_use> after";
        let segments = segment_response(text);
        assert!(tool_calls(&segments).is_empty());
        assert!(answer_text(&segments).contains("before"));
        assert!(answer_text(&segments).contains("after"));
    }

    #[test]
    fn no_calls_means_final_answer() {
        let segments = segment_response("Bottom Line: BTC is at $97,000 today.");
        assert!(tool_calls(&segments).is_empty());
        assert!(answer_text(&segments).starts_with("Bottom Line:"));
    }

    #[test]
    fn strip_trailing_commas_respects_strings() {
        let raw = r#"{"a": "keep, this", "b": [1, 2,],}"#;
        let repaired = strip_trailing_commas(raw);
        let value: serde_json::Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(value["a"], "keep, this");
        assert_eq!(value["b"], json!([1, 2]));
    }
}
