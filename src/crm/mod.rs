use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub mod bitrix;
#[cfg(test)]
pub(crate) mod fake;

pub use bitrix::BitrixClient;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Deal {
    #[serde(rename = "ID", default, deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "TITLE", default)]
    pub title: Option<String>,
    #[serde(rename = "DATE_CREATE", default)]
    pub date_create: Option<String>,
}

impl Deal {
    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or_default()
    }

    pub fn created_at(&self) -> Option<DateTime<FixedOffset>> {
        parse_timestamp(self.date_create.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CallActivity {
    #[serde(rename = "ID", default, deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "OWNER_TYPE_ID", default, deserialize_with = "string_or_number")]
    pub owner_type_id: String,
    #[serde(rename = "OWNER_ID", default, deserialize_with = "string_or_number")]
    pub owner_id: String,
    #[serde(rename = "PROVIDER_ID", default)]
    pub provider_id: Option<String>,
    /// An object with `MISSED_CALL` for calls, an empty array otherwise.
    #[serde(rename = "SETTINGS", default)]
    pub settings: Value,
    #[serde(rename = "SUBJECT", default)]
    pub subject: Option<String>,
    #[serde(rename = "CREATED", default)]
    pub created: Option<String>,
    #[serde(rename = "ORIGIN_ID", default)]
    pub origin_id: Option<String>,
}

impl CallActivity {
    pub fn missed_call(&self) -> bool {
        match self.settings.get("MISSED_CALL") {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(flag)) => flag == "Y" || flag == "true",
            _ => false,
        }
    }

    pub fn created_at(&self) -> Option<DateTime<FixedOffset>> {
        parse_timestamp(self.created.as_deref())
    }

    pub fn subject_digits(&self) -> String {
        digits_only(self.subject.as_deref().unwrap_or_default())
    }

    /// Telephony call id behind `ORIGIN_ID`, with `prefix` removed.
    pub fn call_id(&self, prefix: &str) -> Option<String> {
        let origin = self.origin_id.as_deref().unwrap_or_default().trim();
        let call_id = origin.strip_prefix(prefix).unwrap_or(origin);
        if call_id.is_empty() {
            None
        } else {
            Some(call_id.to_string())
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CallStatistic {
    #[serde(rename = "CALL_ID", default, deserialize_with = "string_or_number")]
    pub call_id: String,
    #[serde(rename = "CALL_DURATION", default, deserialize_with = "string_or_number")]
    pub call_duration: String,
    #[serde(rename = "CALL_FAILED_CODE", default, deserialize_with = "string_or_number")]
    pub call_failed_code: String,
    #[serde(rename = "CALL_LOG", default)]
    pub call_log: Option<String>,
}

impl CallStatistic {
    pub fn log_url(&self) -> Option<&str> {
        self.call_log
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// One `crm.activity.list` search window.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityQuery {
    pub owner_type_id: u32,
    pub owner_id: String,
    pub created_after: DateTime<FixedOffset>,
}

/// The Bitrix24 REST surface the verifier depends on.
#[async_trait]
pub trait CrmApi: Send + Sync {
    /// `Ok(None)` when the CRM reports the deal does not exist.
    async fn get_deal(&self, deal_id: &str) -> Result<Option<Deal>>;
    /// Call activities in the window, newest first.
    async fn list_call_activities(&self, query: &ActivityQuery) -> Result<Vec<CallActivity>>;
    async fn get_call_statistic(&self, call_id: &str) -> Result<Option<CallStatistic>>;
    async fn fetch_call_log(&self, url: &str) -> Result<String>;
    /// Returns the CRM's `result` payload for the update.
    async fn update_deal_field(&self, deal_id: &str, field: &str, value: &str) -> Result<Value>;
}

pub fn digits_only(text: &str) -> String {
    text.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<FixedOffset>> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
}

// Bitrix returns ids as strings, but some portals and proxies hand back numbers.
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}
