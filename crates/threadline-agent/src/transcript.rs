//! Convert the runtime transcript into the client message format.

use std::collections::HashMap;

use serde_json::json;

use threadline_core::protocol::SerializedMessage;
use threadline_core::types::{ChatMessage, Role};

/// Serialize messages, attaching each tool call's output to the call itself.
pub fn serialize_messages(messages: &[ChatMessage]) -> Vec<SerializedMessage> {
    let tool_outputs: HashMap<&str, &str> = messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| {
            m.tool_call_id
                .as_deref()
                .filter(|id| !id.is_empty())
                .map(|id| (id, m.content.as_str()))
        })
        .collect();

    messages
        .iter()
        .enumerate()
        .map(|(index, msg)| {
            let mut metadata = serde_json::Map::new();
            metadata.insert("order_index".into(), json!(index));

            if !msg.tool_calls.is_empty() {
                let calls: Vec<serde_json::Value> = msg
                    .tool_calls
                    .iter()
                    .map(|call| {
                        let mut value = json!({
                            "id": call.id,
                            "name": call.name,
                            "input": call.args,
                        });
                        if let Some(output) = tool_outputs.get(call.id.as_str()) {
                            value["output"] = json!(output);
                        }
                        value
                    })
                    .collect();
                metadata.insert("tool_calls".into(), json!(calls));
            }

            if let Some(name) = msg.name.as_deref().filter(|n| !n.is_empty()) {
                metadata.insert("tool_name".into(), json!(name));
            }
            if let Some(id) = msg.tool_call_id.as_deref().filter(|id| !id.is_empty()) {
                metadata.insert("tool_call_id".into(), json!(id));
            }
            for (key, value) in &msg.extra {
                metadata.insert(key.clone(), value.clone());
            }

            SerializedMessage {
                role: msg.role,
                content: msg.content.clone(),
                metadata,
            }
        })
        .collect()
}
