use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::DbResult;
use crate::relay::param_override::OverrideOperation;
use crate::schema::enum_def::{ChannelStatus, ChannelType};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(default)]
    pub base_url: String,
    /// Raw credential. Some channel types carry a JSON document here.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub status: ChannelStatus,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,
    #[serde(default)]
    pub model_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub settings: ChannelSettings,
    #[serde(default)]
    pub param_override: Vec<OverrideOperation>,
    #[serde(default)]
    pub used_quota: i64,
}

fn default_groups() -> Vec<String> {
    vec!["default".to_string()]
}

impl Channel {
    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    pub fn base_url_or(&self, fallback: &str) -> String {
        let base = if self.base_url.is_empty() { fallback } else { self.base_url.as_str() };
        base.trim_end_matches('/').to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelSettings {
    /// Re-serialize upstream responses through the strict OpenAI shape.
    pub force_format: bool,
    pub thinking_to_content: bool,
    pub system_prompt: Option<String>,
    pub system_prompt_override: bool,
    /// Rewrites message roles before dispatch, e.g. `developer -> system`.
    pub role_mappings: BTreeMap<String, String>,
    pub proxy: Option<String>,
    pub pass_through_body_enabled: bool,
    pub task_status_mapping: Option<TaskStatusMapping>,
    pub api_version: Option<String>,
}

/// Upstream status strings per normalized task state. Matched case-insensitively.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskStatusMapping {
    pub success: Vec<String>,
    pub failure: Vec<String>,
    pub in_progress: Vec<String>,
}

pub trait ChannelStore {
    fn list_channels(&self) -> DbResult<Vec<Channel>>;
    fn update_channel_status(&self, channel_id: i64, status: ChannelStatus) -> DbResult<()>;
    fn add_channel_used_quota(&self, channel_id: i64, quota: i64) -> DbResult<()>;
}
