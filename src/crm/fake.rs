use super::{ActivityQuery, CallActivity, CallStatistic, CrmApi, Deal};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory CRM that records every call made against it.
#[derive(Default)]
pub(crate) struct FakeCrm {
    pub deals: HashMap<String, Deal>,
    pub activities: Vec<CallActivity>,
    pub statistics: HashMap<String, CallStatistic>,
    pub logs: HashMap<String, String>,
    pub fail_on: Option<&'static str>,
    pub calls: Mutex<Vec<String>>,
    pub updates: Mutex<Vec<(String, String, String)>>,
    pub fields: Mutex<HashMap<String, String>>,
}

impl FakeCrm {
    pub fn with_deal(mut self, id: &str, title: &str, created: &str) -> Self {
        self.deals.insert(
            id.to_string(),
            Deal {
                id: id.to_string(),
                title: Some(title.to_string()),
                date_create: Some(created.to_string()),
            },
        );
        self
    }

    pub fn with_activity(mut self, activity: CallActivity) -> Self {
        self.activities.push(activity);
        self
    }

    pub fn with_statistic(mut self, call_id: &str, log_url: Option<&str>) -> Self {
        self.statistics.insert(
            call_id.to_string(),
            CallStatistic {
                call_id: call_id.to_string(),
                call_duration: "42".to_string(),
                call_failed_code: "200".to_string(),
                call_log: log_url.map(str::to_string),
            },
        );
        self
    }

    pub fn with_log(mut self, url: &str, text: &str) -> Self {
        self.logs.insert(url.to_string(), text.to_string());
        self
    }

    pub fn failing_on(mut self, method: &'static str) -> Self {
        self.fail_on = Some(method);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<(String, String, String)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn field(&self, deal_id: &str) -> Option<String> {
        self.fields.lock().unwrap().get(deal_id).cloned()
    }

    fn record(&self, method: &str) -> Result<()> {
        self.calls.lock().unwrap().push(method.to_string());
        if self.fail_on == Some(method) {
            return Err(Error::upstream(method, "connection reset"));
        }
        Ok(())
    }
}

pub(crate) fn activity(id: &str, subject: &str, created: &str, origin_id: &str) -> CallActivity {
    CallActivity {
        id: id.to_string(),
        owner_type_id: "14".to_string(),
        owner_id: "655".to_string(),
        provider_id: Some("VOXIMPLANT_CALL".to_string()),
        settings: json!({ "MISSED_CALL": false }),
        subject: Some(subject.to_string()),
        created: Some(created.to_string()),
        origin_id: Some(origin_id.to_string()),
    }
}

#[async_trait]
impl CrmApi for FakeCrm {
    async fn get_deal(&self, deal_id: &str) -> Result<Option<Deal>> {
        self.record("crm.deal.get")?;
        Ok(self.deals.get(deal_id).cloned())
    }

    async fn list_call_activities(&self, query: &ActivityQuery) -> Result<Vec<CallActivity>> {
        self.record("crm.activity.list")?;
        let mut found: Vec<CallActivity> = self
            .activities
            .iter()
            .filter(|a| {
                a.owner_type_id == query.owner_type_id.to_string() && a.owner_id == query.owner_id
            })
            .filter(|a| {
                a.created_at()
                    .map(|created| created > query.created_after)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        found.sort_by_key(|a| std::cmp::Reverse(a.id.parse::<u64>().unwrap_or(0)));
        Ok(found)
    }

    async fn get_call_statistic(&self, call_id: &str) -> Result<Option<CallStatistic>> {
        self.record("voximplant.statistic.get")?;
        Ok(self.statistics.get(call_id).cloned())
    }

    async fn fetch_call_log(&self, url: &str) -> Result<String> {
        self.record("call log")?;
        self.logs
            .get(url)
            .cloned()
            .ok_or_else(|| Error::upstream("call log", "HTTP 404 Not Found"))
    }

    async fn update_deal_field(&self, deal_id: &str, field: &str, value: &str) -> Result<Value> {
        self.record("crm.deal.update")?;
        self.updates.lock().unwrap().push((
            deal_id.to_string(),
            field.to_string(),
            value.to_string(),
        ));
        self.fields
            .lock()
            .unwrap()
            .insert(deal_id.to_string(), value.to_string());
        Ok(Value::Bool(true))
    }
}
