//! Listing decoders
//!
//! Model registries disagree on the shape of their listing. Each
//! [`ListingDecoder`] either extracts the names or declines with a reason;
//! [`decode_listing`] tries them in order and reports every reason when none fits.

use serde_json::Value;

use crate::error::{ResourceError, ResourceResult};

pub trait ListingDecoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Names found in `body`, or the reason this shape does not apply
    fn decode(&self, body: &Value) -> Result<Vec<String>, String>;
}

/// `{"models": [{"name": "llama3.2:1b", "model": "llama3.2:1b"}, ...]}`
pub struct TagsDecoder;

/// `{"data": [{"id": "Systran/faster-whisper-small"}, ...]}`
pub struct OpenAiModelsDecoder;

/// `["a", "b"]` or `[{"id": "a"}, {"name": "b"}]`
pub struct PlainArrayDecoder;

fn entry_name(entry: &Value, keys: &[&str]) -> Option<String> {
    match entry {
        Value::String(name) => Some(name.clone()),
        Value::Object(fields) => keys
            .iter()
            .find_map(|key| fields.get(*key).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

fn names_from_array(items: &[Value], keys: &[&str], shape: &str) -> Result<Vec<String>, String> {
    items
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            entry_name(entry, keys)
                .ok_or_else(|| format!("{}: entry {} has none of {:?}", shape, i, keys))
        })
        .collect()
}

impl ListingDecoder for TagsDecoder {
    fn name(&self) -> &'static str {
        "tags"
    }

    fn decode(&self, body: &Value) -> Result<Vec<String>, String> {
        match body.get("models") {
            Some(Value::Array(items)) => names_from_array(items, &["name", "model"], "tags"),
            Some(_) => Err("tags: 'models' is not an array".to_string()),
            None => Err("tags: no 'models' field".to_string()),
        }
    }
}

impl ListingDecoder for OpenAiModelsDecoder {
    fn name(&self) -> &'static str {
        "openai-models"
    }

    fn decode(&self, body: &Value) -> Result<Vec<String>, String> {
        match body.get("data") {
            Some(Value::Array(items)) => names_from_array(items, &["id"], "openai-models"),
            Some(_) => Err("openai-models: 'data' is not an array".to_string()),
            None => Err("openai-models: no 'data' field".to_string()),
        }
    }
}

impl ListingDecoder for PlainArrayDecoder {
    fn name(&self) -> &'static str {
        "plain-array"
    }

    fn decode(&self, body: &Value) -> Result<Vec<String>, String> {
        match body {
            Value::Array(items) => names_from_array(items, &["id", "name", "model"], "plain-array"),
            _ => Err("plain-array: body is not an array".to_string()),
        }
    }
}

/// Default decoder chain
pub fn default_decoders() -> Vec<Box<dyn ListingDecoder>> {
    vec![
        Box::new(TagsDecoder),
        Box::new(OpenAiModelsDecoder),
        Box::new(PlainArrayDecoder),
    ]
}

/// First successful decode wins; otherwise `Decode` with all reasons
pub fn decode_listing(
    decoders: &[Box<dyn ListingDecoder>],
    body: &Value,
) -> ResourceResult<Vec<String>> {
    let mut reasons = Vec::with_capacity(decoders.len());
    for decoder in decoders {
        match decoder.decode(body) {
            Ok(names) => {
                tracing::trace!(decoder = decoder.name(), count = names.len(), "Listing decoded");
                return Ok(names);
            }
            Err(reason) => reasons.push(reason),
        }
    }
    Err(ResourceError::Decode { reasons })
}

/// Rows of a CLI listing: first whitespace-delimited column, header row skipped
pub fn parse_cli_rows(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|first| !first.eq_ignore_ascii_case("NAME"))
        .map(str::to_string)
        .collect()
}
