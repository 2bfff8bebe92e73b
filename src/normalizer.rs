//! Turns raw model output into one canonical `Prediction`.
//!
//! Three dialects are understood: native structured function calls, JSON
//! wrapped in `<tool_call>` tags, and `FUNCTION_CALL [Name(key=value)]`
//! bracket syntax. Nothing in here fails: malformed calls come back as API
//! predictions with a missing name and/or parameters, and a warning is logged.
//! A `<tool_call>` that is never closed is treated as plain text.

use crate::client::CompletionResponse;
use crate::config::Dialect;
use crate::models::{Parameters, Prediction};
use regex::Regex;
use serde_json::{Map, Value, json};
use std::sync::LazyLock;
use tracing::{debug, warn};

pub const TOOL_CALL_OPEN: &str = "<tool_call>";
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";
pub const TOOL_RESPONSE_OPEN: &str = "<tool_response>";
pub const TOOL_RESPONSE_CLOSE: &str = "</tool_response>";
pub const FUNCTION_CALL_MARKER: &str = "FUNCTION_CALL";

static NAME_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""name"\s*:\s*"([^"\\]+)""#).expect("valid name pattern"));

/// Normalize one completion according to the configured dialect
pub fn normalize(dialect: Dialect, response: &CompletionResponse) -> Prediction {
    let mut metadata = response.metadata.clone();
    metadata.insert("dialect".to_string(), json!(dialect));

    match dialect {
        Dialect::FunctionCall => normalize_structured(response, metadata),
        Dialect::ToolCallTags => {
            let text = response.content.as_deref().unwrap_or_default();
            metadata.insert("raw_output".to_string(), json!(text));
            normalize_tagged(text, metadata)
        }
        Dialect::BracketCall => {
            let text = response.content.as_deref().unwrap_or_default();
            metadata.insert("raw_output".to_string(), json!(text));
            normalize_bracket(text, metadata)
        }
    }
}

fn normalize_structured(response: &CompletionResponse, metadata: Map<String, Value>) -> Prediction {
    match &response.tool_call {
        Some(call) => Prediction::call(
            Some(call.name.clone()),
            parse_json_arguments(&call.name, &call.arguments),
            metadata,
        ),
        None => Prediction::text(response.content.clone().unwrap_or_default(), metadata),
    }
}

fn normalize_tagged(text: &str, metadata: Map<String, Value>) -> Prediction {
    if !text.contains(TOOL_CALL_OPEN) {
        return Prediction::text(text, metadata);
    }

    let Some(body) = extract_delimited(text, TOOL_CALL_OPEN, TOOL_CALL_CLOSE) else {
        warn!("Unterminated {} in model output, treating it as text", TOOL_CALL_OPEN);
        return Prediction::text(text, metadata);
    };

    let (api_name, parameters) = parse_tagged_body(body);
    Prediction::call(api_name, parameters, metadata)
}

fn normalize_bracket(text: &str, metadata: Map<String, Value>) -> Prediction {
    let Some(position) = text.rfind(FUNCTION_CALL_MARKER) else {
        return Prediction::text(text, metadata);
    };

    let (api_name, parameters) = parse_bracket_call(&text[position + FUNCTION_CALL_MARKER.len()..]);
    Prediction::call(api_name, parameters, metadata)
}

/// Text between the first `open` and the next `close`.
///
/// Without a `close`, a later `open` acts as the closer, which recovers
/// generations that were cut off after starting a second call. Returns
/// `None` when there is no `open`, or no closer of either kind.
pub fn extract_delimited<'a>(message: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let body_start = message.find(open)? + open.len();
    let rest = &message[body_start..];

    let body_end = match rest.find(close) {
        Some(offset) => offset,
        None => rest.rfind(open)?,
    };

    Some(rest[..body_end].trim())
}

/// Parse `{"name": ..., "arguments": {...}}`
fn parse_tagged_body(body: &str) -> (Option<String>, Option<Parameters>) {
    let mut call = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(call)) => call,
        Ok(other) => {
            warn!("Tool call is not a JSON object: {}", other);
            return (None, None);
        }
        Err(err) => {
            let api_name = NAME_FIELD.captures(body).map(|caps| caps[1].to_string());
            warn!("Failed to decode tool call for {:?}: {}", api_name, err);
            debug!("Undecodable tool call body: {}", body);
            return (api_name, None);
        }
    };

    let api_name = match call.remove("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => Some(name.trim().to_string()),
        _ => None,
    };

    let parameters = match call.remove("arguments").or_else(|| call.remove("parameters")) {
        None | Some(Value::Null) => Some(Parameters::new()),
        Some(Value::Object(arguments)) => Some(arguments),
        Some(Value::String(raw)) => parse_json_arguments(api_name.as_deref().unwrap_or("?"), &raw),
        Some(other) => {
            warn!("Arguments for {:?} are not an object: {}", api_name, other);
            None
        }
    };

    (api_name, parameters)
}

/// Decode a JSON arguments string; `None` on anything but an object
fn parse_json_arguments(api_name: &str, arguments: &str) -> Option<Parameters> {
    if arguments.trim().is_empty() {
        return Some(Parameters::new());
    }
    match serde_json::from_str::<Value>(arguments) {
        Ok(Value::Object(parameters)) => Some(parameters),
        Ok(_) | Err(_) => {
            warn!("Failed to decode arguments for {}: {}", api_name, arguments);
            None
        }
    }
}

/// Parse the text after `FUNCTION_CALL`: `[Name(key=value, ...)]`.
///
/// The surrounding list brackets are optional and only the first call is
/// used. A missing `)` (truncated output) still yields a best-effort parse
/// of whatever arguments are present.
pub fn parse_bracket_call(call: &str) -> (Option<String>, Option<Parameters>) {
    let call = call.trim().trim_start_matches(':').trim();
    let call = call.strip_prefix('[').unwrap_or(call).trim_start();
    let call = call.trim_start_matches(['\'', '"']);

    let Some(open) = call.find('(') else {
        let name = call
            .split([']', ','])
            .next()
            .map(|name| name.trim().trim_matches(['\'', '"']))
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        warn!("Function call {:?} has no argument list", name);
        return (name, None);
    };

    let name = call[..open].trim();
    let api_name = (!name.is_empty()).then(|| name.to_string());

    let rest = &call[open + 1..];
    let arguments = match top_level_positions(rest, ')').first() {
        Some(&close) => &rest[..close],
        None => {
            warn!("Function call {:?} is missing its closing parenthesis", api_name);
            rest.trim_end().trim_end_matches(']')
        }
    };

    let parameters = parse_keyword_arguments(arguments);
    if parameters.is_none() {
        warn!("Failed to decode arguments for {:?}: {}", api_name, arguments);
    }
    (api_name, parameters)
}

/// `key=value, key2=value2` where values are JSON or Python-style literals.
/// A single JSON object is accepted too.
fn parse_keyword_arguments(arguments: &str) -> Option<Parameters> {
    let arguments = arguments.trim();
    if arguments.is_empty() {
        return Some(Parameters::new());
    }
    if arguments.starts_with('{') {
        return match serde_json::from_str::<Value>(arguments) {
            Ok(Value::Object(parameters)) => Some(parameters),
            _ => None,
        };
    }

    let mut parameters = Parameters::new();
    for item in split_top_level(arguments, ',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let equals = *top_level_positions(item, '=').first()?;
        let key = item[..equals].trim().trim_matches(['\'', '"']);
        if key.is_empty() {
            return None;
        }
        let value = parse_literal(item[equals + 1..].trim())?;
        parameters.insert(key.to_string(), value);
    }
    Some(parameters)
}

fn parse_literal(raw: &str) -> Option<Value> {
    if raw.is_empty() {
        return None;
    }
    match raw {
        "True" => return Some(Value::Bool(true)),
        "False" => return Some(Value::Bool(false)),
        "None" => return Some(Value::Null),
        _ => {}
    }
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return Some(value);
    }
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        let inner = &raw[1..raw.len() - 1];
        return Some(Value::String(inner.replace("\\'", "'")));
    }
    if raw.starts_with('[') && raw.ends_with(']') {
        let inner = raw[1..raw.len() - 1].trim();
        if inner.is_empty() {
            return Some(Value::Array(Vec::new()));
        }
        return split_top_level(inner, ',')
            .into_iter()
            .map(|item| parse_literal(item.trim()))
            .collect::<Option<Vec<_>>>()
            .map(Value::Array);
    }
    if raw.contains(['"', '\'', '(', ')', '[', ']', '{', '}']) {
        return None;
    }
    Some(Value::String(raw.to_string()))
}

fn split_top_level(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    for position in top_level_positions(text, separator) {
        parts.push(&text[start..position]);
        start = position + separator.len_utf8();
    }
    parts.push(&text[start..]);
    parts
}

/// Byte offsets of `target` outside quotes and at nesting depth zero
fn top_level_positions(text: &str, target: char) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (index, c) in text.char_indices() {
        if let Some(open_quote) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == open_quote {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            c if c == target && depth == 0 => positions.push(index),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    positions
}

/// Write-side counterpart of the tagged dialect
pub fn render_tagged_call(api_name: &str, parameters: &Parameters) -> String {
    let call = json!({"name": api_name, "arguments": parameters});
    format!("{}\n{}\n{}", TOOL_CALL_OPEN, call, TOOL_CALL_CLOSE)
}

/// Write-side counterpart of the bracket dialect; values are JSON literals
pub fn render_bracket_call(api_name: &str, parameters: &Parameters) -> String {
    let arguments: Vec<String> = parameters
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    format!("{} [{}({})]", FUNCTION_CALL_MARKER, api_name, arguments.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ToolCallPayload;
    use crate::models::PredictedRequest;

    fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            content: Some(text.to_string()),
            tool_call: None,
            metadata: Map::new(),
        }
    }

    fn request_of(prediction: &Prediction) -> &PredictedRequest {
        match prediction {
            Prediction::Api(call) => &call.request,
            other => panic!("expected api prediction, got {:?}", other),
        }
    }

    fn params(value: Value) -> Parameters {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_extract_delimited() {
        assert_eq!(extract_delimited("a <t> body </t> z", "<t>", "</t>"), Some("body"));
        assert_eq!(extract_delimited("no tags here", "<t>", "</t>"), None);
        // later opening tag stands in for the missing closer
        assert_eq!(extract_delimited("<t> first <t> second", "<t>", "</t>"), Some("first"));
        assert_eq!(extract_delimited("<t> truncated", "<t>", "</t>"), None);
        // closer before the opener does not count
        assert_eq!(extract_delimited("</t> <t> x", "<t>", "</t>"), None);
    }

    #[test]
    fn test_tagged_round_trip() {
        let parameters = params(json!({"receiver": "bob", "message": "hi", "urgent": true, "count": 2}));
        let output = format!("Sure.\n{}", render_tagged_call("SendMessage", &parameters));

        let prediction = normalize(Dialect::ToolCallTags, &text_response(&output));
        let request = request_of(&prediction);
        assert_eq!(request.api_name.as_deref(), Some("SendMessage"));
        assert_eq!(request.parameters.as_ref(), Some(&parameters));
    }

    #[test]
    fn test_tagged_plain_text() {
        let prediction = normalize(Dialect::ToolCallTags, &text_response("The weather is sunny."));
        match prediction {
            Prediction::Assistant(text) => {
                assert_eq!(text.text, "The weather is sunny.");
                assert_eq!(text.metadata["dialect"], "tool_call_tags");
                assert_eq!(text.metadata["raw_output"], "The weather is sunny.");
            }
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_tagged_unterminated_is_text() {
        let output = r#"<tool_call>{"name": "SendMessage", "arguments": {"recei"#;
        match normalize(Dialect::ToolCallTags, &text_response(output)) {
            Prediction::Assistant(reply) => {
                assert_eq!(reply.text, output);
                assert_eq!(reply.metadata["raw_output"], output);
            }
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_tagged_truncated_with_second_opener() {
        let output = r#"<tool_call>{"name": "CurrentWeather", "arguments": {"city": "Paris"}}<tool_call>{"name": "Sen"#;
        let prediction = normalize(Dialect::ToolCallTags, &text_response(output));
        let request = request_of(&prediction);
        assert_eq!(request.api_name.as_deref(), Some("CurrentWeather"));
        assert_eq!(request.parameters.as_ref(), Some(&params(json!({"city": "Paris"}))));
    }

    #[test]
    fn test_tagged_malformed_json_keeps_name() {
        let output = r#"<tool_call>{"name": "SendMessage", "arguments": {"receiver": bob}}</tool_call>"#;
        let prediction = normalize(Dialect::ToolCallTags, &text_response(output));
        let request = request_of(&prediction);
        assert_eq!(request.api_name.as_deref(), Some("SendMessage"));
        assert!(request.parameters.is_none());
    }

    #[test]
    fn test_tagged_string_arguments() {
        let output = r#"<tool_call>{"name": "CurrentWeather", "arguments": "{\"city\": \"Oslo\"}"}</tool_call>"#;
        let prediction = normalize(Dialect::ToolCallTags, &text_response(output));
        assert_eq!(request_of(&prediction).parameters.as_ref(), Some(&params(json!({"city": "Oslo"}))));
    }

    #[test]
    fn test_tagged_missing_arguments_is_empty() {
        let output = r#"<tool_call>{"name": "ListContacts"}</tool_call>"#;
        let prediction = normalize(Dialect::ToolCallTags, &text_response(output));
        assert_eq!(request_of(&prediction).parameters.as_ref(), Some(&Parameters::new()));
    }

    #[test]
    fn test_structured_call() {
        let response = CompletionResponse {
            content: None,
            tool_call: Some(ToolCallPayload {
                id: "call_1".to_string(),
                name: "SendMessage".to_string(),
                arguments: r#"{"receiver": "bob", "message": "hi"}"#.to_string(),
            }),
            metadata: Map::new(),
        };
        let prediction = normalize(Dialect::FunctionCall, &response);
        let request = request_of(&prediction);
        assert_eq!(request.api_name.as_deref(), Some("SendMessage"));
        assert_eq!(
            request.parameters.as_ref(),
            Some(&params(json!({"receiver": "bob", "message": "hi"})))
        );
    }

    #[test]
    fn test_structured_bad_arguments() {
        let response = CompletionResponse {
            content: None,
            tool_call: Some(ToolCallPayload {
                id: "call_1".to_string(),
                name: "SendMessage".to_string(),
                arguments: r#"{"receiver": "bob", "mess"#.to_string(),
            }),
            metadata: Map::new(),
        };
        let prediction = normalize(Dialect::FunctionCall, &response);
        let request = request_of(&prediction);
        assert_eq!(request.api_name.as_deref(), Some("SendMessage"));
        assert!(request.parameters.is_none());
    }

    #[test]
    fn test_structured_text() {
        let response = CompletionResponse {
            content: Some("Hello!".to_string()),
            tool_call: None,
            metadata: Map::new(),
        };
        match normalize(Dialect::FunctionCall, &response) {
            Prediction::Assistant(text) => assert_eq!(text.text, "Hello!"),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_bracket_round_trip() {
        let parameters = params(json!({"receiver": "bob", "message": "hi, (see) [this]", "limit": 3}));
        let output = render_bracket_call("SendMessage", &parameters);

        let prediction = normalize(Dialect::BracketCall, &text_response(&output));
        let request = request_of(&prediction);
        assert_eq!(request.api_name.as_deref(), Some("SendMessage"));
        assert_eq!(request.parameters.as_ref(), Some(&parameters));
    }

    #[test]
    fn test_bracket_without_list_brackets() {
        let (name, parameters) = parse_bracket_call(" CurrentWeather(city='New York')");
        assert_eq!(name.as_deref(), Some("CurrentWeather"));
        assert_eq!(parameters, Some(params(json!({"city": "New York"}))));
    }

    #[test]
    fn test_bracket_python_literals() {
        let (name, parameters) =
            parse_bracket_call("['SearchMessages(query=\"it's late\", limit=None, exact=True, tags=['a', 'b'])']");
        assert_eq!(name.as_deref(), Some("SearchMessages"));
        assert_eq!(
            parameters,
            Some(params(json!({"query": "it's late", "limit": null, "exact": true, "tags": ["a", "b"]})))
        );
    }

    #[test]
    fn test_bracket_only_first_call_used() {
        let (name, parameters) = parse_bracket_call("[A(x=1), B(y=2)]");
        assert_eq!(name.as_deref(), Some("A"));
        assert_eq!(parameters, Some(params(json!({"x": 1}))));
    }

    #[test]
    fn test_bracket_truncated() {
        let (name, parameters) = parse_bracket_call("[CurrentWeather(city=\"Paris\"");
        assert_eq!(name.as_deref(), Some("CurrentWeather"));
        assert_eq!(parameters, Some(params(json!({"city": "Paris"}))));
    }

    #[test]
    fn test_bracket_unparsable_arguments() {
        let (name, parameters) = parse_bracket_call("[SendMessage(bob, \"hi\")]");
        assert_eq!(name.as_deref(), Some("SendMessage"));
        assert!(parameters.is_none());
    }

    #[test]
    fn test_bracket_json_object_arguments() {
        let (name, parameters) = parse_bracket_call(r#"[CurrentWeather({"city": "Lima"})]"#);
        assert_eq!(name.as_deref(), Some("CurrentWeather"));
        assert_eq!(parameters, Some(params(json!({"city": "Lima"}))));
    }

    #[test]
    fn test_bracket_no_marker_is_text() {
        match normalize(Dialect::BracketCall, &text_response("CurrentWeather(city='Paris')")) {
            Prediction::Assistant(text) => assert_eq!(text.text, "CurrentWeather(city='Paris')"),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn test_bracket_uses_last_marker() {
        let output = "I will use FUNCTION_CALL syntax.\nFUNCTION_CALL [ListContacts()]";
        let prediction = normalize(Dialect::BracketCall, &text_response(output));
        let request = request_of(&prediction);
        assert_eq!(request.api_name.as_deref(), Some("ListContacts"));
        assert_eq!(request.parameters.as_ref(), Some(&Parameters::new()));
    }

    #[test]
    fn test_usage_metadata_is_kept() {
        let mut response = text_response("hi");
        response.metadata.insert("total_tokens".to_string(), json!(12));
        match normalize(Dialect::ToolCallTags, &response) {
            Prediction::Assistant(reply) => assert_eq!(reply.metadata["total_tokens"], 12),
            other => panic!("expected text prediction, got {:?}", other),
        }
    }
}
