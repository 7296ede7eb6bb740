use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::snowflake::snowflake_field;
use crate::Snowflake;

// Interaction types
pub const INTERACTION_PING: u8 = 1;
pub const INTERACTION_APPLICATION_COMMAND: u8 = 2;
pub const INTERACTION_MESSAGE_COMPONENT: u8 = 3;
pub const INTERACTION_AUTOCOMPLETE: u8 = 4;
pub const INTERACTION_MODAL_SUBMIT: u8 = 5;

// Component types
pub const COMPONENT_BUTTON: u8 = 2;
pub const COMPONENT_STRING_SELECT: u8 = 3;
pub const COMPONENT_TEXT_INPUT: u8 = 4;
pub const COMPONENT_CHANNEL_SELECT: u8 = 8;

// Callback types
pub const CALLBACK_CHANNEL_MESSAGE_WITH_SOURCE: u8 = 4;
pub const CALLBACK_DEFERRED_CHANNEL_MESSAGE: u8 = 5;
pub const CALLBACK_DEFERRED_UPDATE_MESSAGE: u8 = 6;
pub const CALLBACK_UPDATE_MESSAGE: u8 = 7;

/// Only the invoking user can see the message.
pub const MESSAGE_FLAG_EPHEMERAL: u64 = 1 << 6;

/// An INTERACTION_CREATE payload reduced to the fields the core routes on.
/// The full payload stays available in `raw`.
#[derive(Debug, Clone)]
pub struct Interaction {
    pub id: Snowflake,
    pub token: String,
    pub kind: u8,
    pub channel_id: Option<Snowflake>,
    pub message_id: Option<Snowflake>,
    pub user_id: Option<Snowflake>,
    pub data: Value,
    pub raw: Value,
}

impl Interaction {
    pub fn from_value(raw: &Value) -> Option<Self> {
        let id = snowflake_field(raw, "id")?;
        let token = raw.get("token")?.as_str()?.to_string();
        let kind = raw.get("type")?.as_u64()? as u8;
        let channel_id = snowflake_field(raw, "channel_id")
            .or_else(|| raw.get("channel").and_then(|c| snowflake_field(c, "id")));
        let message_id = raw.get("message").and_then(|m| snowflake_field(m, "id"));
        // Guild interactions carry the actor under member.user, DMs under user.
        let user_id = raw
            .get("member")
            .and_then(|m| m.get("user"))
            .and_then(|u| snowflake_field(u, "id"))
            .or_else(|| raw.get("user").and_then(|u| snowflake_field(u, "id")));
        Some(Self {
            id,
            token,
            kind,
            channel_id,
            message_id,
            user_id,
            data: raw.get("data").cloned().unwrap_or(Value::Null),
            raw: raw.clone(),
        })
    }

    pub fn custom_id(&self) -> Option<&str> {
        self.data.get("custom_id").and_then(Value::as_str)
    }

    pub fn component_type(&self) -> Option<u8> {
        self.data
            .get("component_type")
            .and_then(Value::as_u64)
            .map(|v| v as u8)
    }

    pub fn is_button(&self) -> bool {
        self.kind == INTERACTION_MESSAGE_COMPONENT && self.component_type() == Some(COMPONENT_BUTTON)
    }

    pub fn is_select_menu(&self) -> bool {
        self.kind == INTERACTION_MESSAGE_COMPONENT
            && matches!(self.component_type(), Some(t) if (COMPONENT_STRING_SELECT..=COMPONENT_CHANNEL_SELECT).contains(&t) && t != COMPONENT_TEXT_INPUT)
    }

    pub fn is_modal_submit(&self) -> bool {
        self.kind == INTERACTION_MODAL_SUBMIT
    }

    /// Values picked in a select menu.
    pub fn values(&self) -> Vec<String> {
        self.data
            .get("values")
            .and_then(Value::as_array)
            .map(|vals| {
                vals.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `(custom_id, value)` for every text input of a submitted modal.
    pub fn modal_fields(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let rows = self
            .data
            .get("components")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for row in rows {
            let Some(children) = row.get("components").and_then(Value::as_array) else {
                continue;
            };
            for input in children {
                if let (Some(id), Some(value)) = (
                    input.get("custom_id").and_then(Value::as_str),
                    input.get("value").and_then(Value::as_str),
                ) {
                    out.push((id.to_string(), value.to_string()));
                }
            }
        }
        out
    }
}

/// Body of an interaction callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionResponse {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl InteractionResponse {
    pub fn message(content: impl Into<String>, ephemeral: bool) -> Self {
        let mut data = json!({ "content": content.into() });
        if ephemeral {
            data["flags"] = json!(MESSAGE_FLAG_EPHEMERAL);
        }
        Self {
            kind: CALLBACK_CHANNEL_MESSAGE_WITH_SOURCE,
            data: Some(data),
        }
    }

    pub fn deferred_update() -> Self {
        Self {
            kind: CALLBACK_DEFERRED_UPDATE_MESSAGE,
            data: None,
        }
    }

    /// Transient reply for users pressing someone else's component.
    pub fn not_authorized() -> Self {
        Self::message("You are not the one who can use these interactions!", true)
    }
}
