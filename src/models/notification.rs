/**
 * REQUIREMENT: Categorized, templated notifications delivered to subscribed users
 * PURPOSE: Model the notification records, templates, and read state
 */
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::message::MessagePriority;

/// Caller-supplied notification request; template fields fill in the gaps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    #[serde(rename = "type")]
    pub notification_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Data bag interpolated into `{placeholder}` tokens
    #[serde(default)]
    pub data: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<MessagePriority>,
}

/// A rendered notification as delivered to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub category: String,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub priority: MessagePriority,
    pub room_id: String,
    pub sender_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

/// Template catalogue entry: type -> rendered fields
#[derive(Debug, Clone)]
pub struct NotificationTemplate {
    pub title: &'static str,
    pub message: &'static str,
    pub icon: &'static str,
    pub priority: MessagePriority,
    pub category: &'static str,
}

/// Interpolate `{placeholder}` tokens from the data bag; unknown tokens are left as-is
pub fn interpolate(template: &str, data: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in data {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}
