//! XML response parsing with repeated-id tolerance
//!
//! The LLM answers in an `<items><item id="k">…</item></items>` envelope.
//! Real providers sometimes emit several `<item>` blocks with the same
//! id; items are therefore grouped by id with first-value-wins per
//! output field, while tool calls accumulate across blocks.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{trace, warn};

use crate::error::{AgentError, Result};

/// One tool call requested by the model
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ToolCallSpec {
    pub name: String,
    /// Raw argument string as emitted (JSON expected, tolerated if not)
    pub raw_args: String,
}

impl ToolCallSpec {
    /// Parse the arguments as JSON, tolerating a plain string
    #[must_use]
    pub fn args(&self) -> Value {
        serde_json::from_str(&self.raw_args)
            .unwrap_or_else(|_| Value::String(self.raw_args.clone()))
    }
}

/// One merged item from the response
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ParsedItem {
    pub id: u32,
    pub reasoning: Option<String>,
    /// Output fields other than reasoning and tool calls, first value wins
    pub output: BTreeMap<String, String>,
    pub tool_calls: Vec<ToolCallSpec>,
}

impl ParsedItem {
    /// Fetch an output field
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.output.get(name).map(String::as_str)
    }
}

/// A fully parsed response, items ordered by id
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ParsedResponse {
    pub items: Vec<ParsedItem>,
}

impl ParsedResponse {
    /// The first item, which carries the answer in single-item mode
    #[must_use]
    pub fn first(&self) -> Option<&ParsedItem> {
        self.items.first()
    }
}

/// Parse an agent response
///
/// Leading/trailing prose around the `<items>` envelope is ignored, as is
/// a markdown code fence.
///
/// # Errors
///
/// `AgentError::Parse` when no `<items>` envelope can be found at all.
pub fn parse_agent_response(raw: &str) -> Result<ParsedResponse> {
    let xml = isolate_envelope(raw)
        .ok_or_else(|| AgentError::Parse("no <items> envelope in response".to_string()))?;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut items: BTreeMap<u32, ParsedItem> = BTreeMap::new();
    let mut current_id: Option<u32> = None;
    let mut field_stack: Vec<String> = Vec::new();
    let mut pending_tool: Option<String> = None;
    let mut text_buffer = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
                match name.as_str() {
                    "items" => {}
                    "item" => {
                        let id = start
                            .attributes()
                            .flatten()
                            .find(|a| a.key.as_ref() == b"id")
                            .and_then(|a| {
                                String::from_utf8_lossy(&a.value).parse::<u32>().ok()
                            })
                            .unwrap_or(1);
                        current_id = Some(id);
                        items.entry(id).or_insert_with(|| ParsedItem {
                            id,
                            ..ParsedItem::default()
                        });
                    }
                    "tool_calls" => {}
                    "tool_call" => {
                        pending_tool = start
                            .attributes()
                            .flatten()
                            .find(|a| a.key.as_ref() == b"name")
                            .map(|a| String::from_utf8_lossy(&a.value).to_string());
                        text_buffer.clear();
                    }
                    other => {
                        field_stack.push(other.to_string());
                        text_buffer.clear();
                    }
                }
            }
            Ok(Event::Text(text)) => {
                if let Ok(decoded) = text.unescape() {
                    text_buffer.push_str(&decoded);
                }
            }
            Ok(Event::CData(cdata)) => {
                text_buffer.push_str(&String::from_utf8_lossy(&cdata));
            }
            Ok(Event::End(end)) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).to_string();
                match name.as_str() {
                    "items" => break,
                    "item" => current_id = None,
                    "tool_calls" => {}
                    "tool_call" => {
                        let Some(tool_name) = pending_tool.take() else {
                            warn!("tool_call without name attribute; skipped");
                            continue;
                        };
                        if let Some(item) = current_item(&mut items, current_id) {
                            item.tool_calls.push(ToolCallSpec {
                                name: tool_name,
                                raw_args: text_buffer.trim().to_string(),
                            });
                        }
                        text_buffer.clear();
                    }
                    other => {
                        if field_stack.last().map(String::as_str) == Some(other) {
                            field_stack.pop();
                        }
                        let value = text_buffer.trim().to_string();
                        text_buffer.clear();
                        if let Some(item) = current_item(&mut items, current_id) {
                            if other == "reasoning" {
                                // First value wins on repeated ids.
                                if item.reasoning.is_none() && !value.is_empty() {
                                    item.reasoning = Some(value);
                                }
                            } else if !value.is_empty() {
                                item.output.entry(other.to_string()).or_insert(value);
                            }
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                // Tolerate sloppy XML: log and stop consuming.
                warn!(error = %e, "XML parse stopped early");
                break;
            }
        }
    }

    trace!(items = items.len(), "Parsed agent response");
    Ok(ParsedResponse {
        items: items.into_values().collect(),
    })
}

fn current_item(
    items: &mut BTreeMap<u32, ParsedItem>,
    current_id: Option<u32>,
) -> Option<&mut ParsedItem> {
    current_id.and_then(|id| items.get_mut(&id))
}

fn isolate_envelope(raw: &str) -> Option<&str> {
    let start = raw.find("<items")?;
    let end = raw.rfind("</items>").map_or(raw.len(), |i| i + "</items>".len());
    Some(&raw[start..end])
}

/// The output-format block appended to every agent prompt
#[must_use]
pub fn response_schema_block(terminal_field: &str) -> String {
    format!(
        "Respond with XML only, in this exact envelope:\n\
         <items>\n\
         <item id=\"1\">\n\
         <reasoning>why you are doing what you are doing</reasoning>\n\
         <{terminal_field}>your final answer, once you have one</{terminal_field}>\n\
         <tool_calls>\n\
         <tool_call name=\"tool_name\">{{\"arg\": \"value\"}}</tool_call>\n\
         </tool_calls>\n\
         </item>\n\
         </items>\n\
         Omit <{terminal_field}> while you still need tool results. \
         Omit <tool_calls> when you are done."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_simple_answer() {
        let response = parse_agent_response(
            "<items><item id=\"1\">\
             <reasoning>simple question</reasoning>\
             <answer>42</answer>\
             </item></items>",
        )
        .unwrap();

        let item = response.first().unwrap();
        assert_eq!(item.field("answer"), Some("42"));
        assert_eq!(item.reasoning.as_deref(), Some("simple question"));
        assert!(item.tool_calls.is_empty());
    }

    #[test]
    fn test_parse_tool_calls() {
        let response = parse_agent_response(
            "<items><item id=\"1\"><tool_calls>\
             <tool_call name=\"write_file\">{\"path\":\"a.ts\",\"content\":\"x\"}</tool_call>\
             <tool_call name=\"brain_search\">{\"query\":\"class Foo\"}</tool_call>\
             </tool_calls></item></items>",
        )
        .unwrap();

        let item = response.first().unwrap();
        assert_eq!(item.tool_calls.len(), 2);
        assert_eq!(item.tool_calls[0].name, "write_file");
        assert_eq!(item.tool_calls[1].args(), json!({"query": "class Foo"}));
    }

    #[test]
    fn test_repeated_ids_merge_first_value_wins() {
        let response = parse_agent_response(
            "<items>\
             <item id=\"1\"><answer>first</answer></item>\
             <item id=\"1\"><answer>second</answer>\
             <tool_calls><tool_call name=\"read_file\">{}</tool_call></tool_calls>\
             </item>\
             </items>",
        )
        .unwrap();

        assert_eq!(response.items.len(), 1);
        let item = response.first().unwrap();
        assert_eq!(item.field("answer"), Some("first"));
        // Tool calls accumulate across the repeated blocks.
        assert_eq!(item.tool_calls.len(), 1);
    }

    #[test]
    fn test_prose_and_fences_around_envelope() {
        let response = parse_agent_response(
            "Sure, here is my answer:\n```xml\n\
             <items><item id=\"1\"><answer>ok</answer></item></items>\n```\nDone.",
        )
        .unwrap();
        assert_eq!(response.first().unwrap().field("answer"), Some("ok"));
    }

    #[test]
    fn test_missing_envelope_is_an_error() {
        assert!(parse_agent_response("no xml here at all").is_err());
    }

    #[test]
    fn test_multiple_items_ordered_by_id() {
        let response = parse_agent_response(
            "<items>\
             <item id=\"2\"><answer>b</answer></item>\
             <item id=\"1\"><answer>a</answer></item>\
             </items>",
        )
        .unwrap();
        assert_eq!(response.items.len(), 2);
        assert_eq!(response.items[0].id, 1);
        assert_eq!(response.items[1].id, 2);
    }

    #[test]
    fn test_non_json_args_tolerated() {
        let spec = ToolCallSpec {
            name: "read_file".into(),
            raw_args: "src/main.rs".into(),
        };
        assert_eq!(spec.args(), json!("src/main.rs"));
    }
}
