//! WebSocket wire protocol.
//!
//! Messages are JSON with a `type` tag and camelCase payload fields.
//! Timestamps and date fields are epoch milliseconds; enumerations are
//! their string tags.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::delta::Delta;
use crate::instruments::Instrument;

/// Subscribe payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub instrument_ids: Vec<String>,
    /// Predicate tree, parsed and validated at the boundary.
    #[serde(default)]
    pub filter: Option<Value>,
    /// Desired updates per second; the server default applies when absent.
    #[serde(default)]
    pub update_frequency: Option<f64>,
}

/// Client → server messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Subscribe(SubscribeRequest),
    Unsubscribe { subscription_id: String },
    Ping,
}

/// Server → client messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    SubscribeAck {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        subscription_id: Option<String>,
        message: String,
    },
    UnsubscribeAck {
        success: bool,
        message: String,
    },
    InitialData {
        instruments: Vec<Instrument>,
    },
    InstrumentUpdate(Delta),
    Pong,
}

impl ServerMessage {
    pub fn subscribe_ok(subscription_id: String) -> Self {
        ServerMessage::SubscribeAck {
            success: true,
            subscription_id: Some(subscription_id),
            message: "subscribed".to_string(),
        }
    }

    pub fn subscribe_rejected(message: impl Into<String>) -> Self {
        ServerMessage::SubscribeAck {
            success: false,
            subscription_id: None,
            message: message.into(),
        }
    }

    pub fn unsubscribe_ack(success: bool, message: impl Into<String>) -> Self {
        ServerMessage::UnsubscribeAck {
            success,
            message: message.into(),
        }
    }
}
