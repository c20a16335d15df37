use serde_json::{json, Value};

use confab_core::errors::GenerationError;
use confab_core::provider::{ContextBlock, ContextSource, GenerationRequest, DELEGATION_DIRECTIVE};

/// Text and usage pulled out of a Messages API response.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Build a non-streaming Messages API request body.
pub fn build_request_body(request: &GenerationRequest, model: &str, max_tokens: u32) -> Value {
    json!({
        "model": model,
        "max_tokens": max_tokens,
        "system": build_system_prompt(request),
        "messages": [
            {"role": "user", "content": request.query},
        ],
    })
}

/// Agent prompt followed by one section per context block.
pub fn build_system_prompt(request: &GenerationRequest) -> String {
    let mut system = request.prompt.trim().to_string();

    for block in &request.context {
        system.push_str("\n\n");
        system.push_str(&render_block(block));
    }

    if !request.available_specialists.is_empty() {
        system.push_str(&format!(
            "\n\nIf a question needs a specialist's knowledge, reply with a single line \
             `{DELEGATION_DIRECTIVE}<key>: <question>` and nothing else. \
             Available specialists: {}.",
            request.available_specialists.join(", ")
        ));
    }
    system
}

fn render_block(block: &ContextBlock) -> String {
    let heading = match &block.source {
        ContextSource::Scope { scope } => format!("## Organization {scope}"),
        ContextSource::History => "## Recent conversation".to_string(),
        ContextSource::Specialist { specialist_key } => {
            format!("## Answer from the {specialist_key} specialist")
        }
    };
    let body = match (&block.source, &block.data) {
        (_, Value::String(s)) => s.clone(),
        (ContextSource::History, Value::Array(turns)) => turns
            .iter()
            .map(|turn| {
                let speaker = turn["speaker"].as_str().unwrap_or("unknown");
                let content = turn["content"].as_str().unwrap_or_default();
                format!("{speaker}: {content}")
            })
            .collect::<Vec<_>>()
            .join("\n"),
        (_, other) => serde_json::to_string_pretty(other).unwrap_or_default(),
    };
    format!("{heading}\n{body}")
}

/// Extract concatenated text and token usage from a response body.
pub fn parse_response(body: &Value) -> Result<ParsedResponse, GenerationError> {
    let content = body["content"]
        .as_array()
        .ok_or_else(|| GenerationError::MalformedResponse("missing content array".into()))?;

    let text: String = content
        .iter()
        .filter(|block| block["type"] == "text")
        .filter_map(|block| block["text"].as_str())
        .collect::<Vec<_>>()
        .join("");

    if text.trim().is_empty() {
        return Err(GenerationError::MalformedResponse(
            "response contained no text".into(),
        ));
    }

    Ok(ParsedResponse {
        text,
        input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0),
    })
}
