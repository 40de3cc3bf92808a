use super::{ActivityQuery, CallActivity, CallStatistic, CrmApi, Deal};
use crate::config::BitrixConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ACTIVITY_FIELDS: [&str; 8] = [
    "ID",
    "OWNER_TYPE_ID",
    "OWNER_ID",
    "PROVIDER_ID",
    "SETTINGS",
    "SUBJECT",
    "CREATED",
    "ORIGIN_ID",
];

/// Upper bound on `crm.activity.list` pages (50 rows each) read per scope.
pub(crate) const MAX_LIST_PAGES: usize = 10;

/// Client for a Bitrix24 inbound webhook (`https://<portal>/rest/<user>/<secret>`).
pub struct BitrixClient {
    base: String,
    provider_id: String,
    client: Client,
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: Option<T>,
    /// Offset of the next page on list methods.
    #[serde(default)]
    next: Option<Value>,
    #[serde(default)]
    total: Option<Value>,
    error: Option<String>,
    error_description: Option<String>,
}

impl<T> Envelope<T> {
    fn next_offset(&self) -> Option<u64> {
        as_offset(self.next.as_ref())
    }
}

fn as_offset(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A decoded REST reply: either the envelope or the error the portal reported.
enum Reply<T> {
    Done(Envelope<T>),
    Rejected { code: String, description: String },
}

impl BitrixClient {
    pub fn new(config: &BitrixConfig) -> Self {
        let timeout = Duration::from_millis(config.timeout_ms.unwrap_or(10_000));
        let useragent = config
            .useragent
            .clone()
            .unwrap_or_else(crate::version::get_useragent);
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(useragent)
            .build()
            .unwrap_or_default();
        Self {
            base: config.webhook_base().to_string(),
            provider_id: config.provider_id.clone(),
            client,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.base, method)
    }

    /// Sends a REST call and decodes the `{result, error}` envelope. Transport,
    /// HTTP and decoding failures become `Error::Upstream`.
    async fn exchange<T: DeserializeOwned>(
        &self,
        method: &str,
        request: RequestBuilder,
    ) -> Result<Reply<T>> {
        let start = Instant::now();
        let response = request.send().await.map_err(|e| {
            warn!(
                method,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "bitrix request failed: {}",
                e
            );
            Error::upstream(method, e)
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::upstream(method, e))?;
        debug!(
            method,
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "bitrix response"
        );

        let envelope: Envelope<T> = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(Error::upstream(method, format!("HTTP {}", status)));
            }
            Err(e) => return Err(Error::upstream(method, format!("invalid response: {}", e))),
        };

        if envelope.error.is_some() || envelope.error_description.is_some() {
            return Ok(Reply::Rejected {
                code: envelope.error.unwrap_or_default(),
                description: envelope.error_description.unwrap_or_default(),
            });
        }
        if !status.is_success() {
            return Err(Error::upstream(method, format!("HTTP {}", status)));
        }
        Ok(Reply::Done(envelope))
    }

    /// Like [`exchange`](Self::exchange), with every portal error mapped to
    /// `Error::Upstream`.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        request: RequestBuilder,
    ) -> Result<Envelope<T>> {
        match self.exchange(method, request).await? {
            Reply::Done(envelope) => Ok(envelope),
            Reply::Rejected { code, description } => Err(rejected(method, code, description)),
        }
    }
}

fn rejected(method: &str, code: String, description: String) -> Error {
    warn!(method, code = %code, description = %description, "bitrix returned an error");
    let message = if description.is_empty() {
        code
    } else if code.is_empty() {
        description
    } else {
        format!("{} ({})", code, description)
    };
    Error::upstream(method, message)
}

fn is_not_found(code: &str, description: &str) -> bool {
    code.eq_ignore_ascii_case("NOT_FOUND") || description.to_lowercase().contains("not found")
}

#[async_trait]
impl CrmApi for BitrixClient {
    async fn get_deal(&self, deal_id: &str) -> Result<Option<Deal>> {
        let method = "crm.deal.get";
        let request = self
            .client
            .get(self.method_url(method))
            .query(&[("id", deal_id)]);
        match self.exchange(method, request).await? {
            Reply::Done(envelope) => Ok(envelope.result),
            Reply::Rejected { code, description } if is_not_found(&code, &description) => {
                debug!(deal_id, "deal not found");
                Ok(None)
            }
            Reply::Rejected { code, description } => Err(rejected(method, code, description)),
        }
    }

    async fn list_call_activities(&self, query: &ActivityQuery) -> Result<Vec<CallActivity>> {
        let method = "crm.activity.list";
        let owner_type_id = query.owner_type_id.to_string();
        let created_after = query.created_after.to_rfc3339();
        let mut params: Vec<(&str, &str)> = vec![
            ("filter[OWNER_TYPE_ID]", owner_type_id.as_str()),
            ("filter[OWNER_ID]", query.owner_id.as_str()),
            ("filter[PROVIDER_ID]", self.provider_id.as_str()),
            ("filter[>CREATED]", created_after.as_str()),
            ("order[ID]", "DESC"),
        ];
        params.extend(ACTIVITY_FIELDS.iter().map(|field| ("select[]", *field)));

        let mut activities: Vec<CallActivity> = Vec::new();
        let mut start = 0u64;
        let mut pages = 0;
        loop {
            let offset = start.to_string();
            let mut page_params = params.clone();
            page_params.push(("start", offset.as_str()));
            let request = self.client.get(self.method_url(method)).query(&page_params);
            let envelope: Envelope<Vec<CallActivity>> = self.call(method, request).await?;
            pages += 1;
            let next = envelope.next_offset();
            let total = as_offset(envelope.total.as_ref());
            activities.extend(envelope.result.unwrap_or_default());

            match next {
                Some(next) if next > start && pages < MAX_LIST_PAGES => start = next,
                Some(_) => {
                    warn!(
                        owner_type_id = query.owner_type_id,
                        owner_id = %query.owner_id,
                        fetched = activities.len(),
                        total = total.unwrap_or_default(),
                        "call activity listing truncated"
                    );
                    break;
                }
                None => break,
            }
        }
        info!(
            owner_type_id = query.owner_type_id,
            owner_id = %query.owner_id,
            created_after = %created_after,
            count = activities.len(),
            pages,
            "call activities listed"
        );
        Ok(activities)
    }

    async fn get_call_statistic(&self, call_id: &str) -> Result<Option<CallStatistic>> {
        let method = "voximplant.statistic.get";
        let request = self
            .client
            .get(self.method_url(method))
            .query(&[("FILTER[CALL_ID]", call_id)]);
        let envelope: Envelope<Vec<CallStatistic>> = self.call(method, request).await?;
        let records = envelope.result.unwrap_or_default();
        Ok(records.into_iter().next())
    }

    async fn fetch_call_log(&self, url: &str) -> Result<String> {
        let method = "call log";
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::upstream(method, e))?;
        if !response.status().is_success() {
            return Err(Error::upstream(
                method,
                format!("HTTP {}", response.status()),
            ));
        }
        response.text().await.map_err(|e| Error::upstream(method, e))
    }

    async fn update_deal_field(&self, deal_id: &str, field: &str, value: &str) -> Result<Value> {
        let method = "crm.deal.update";
        let payload = json!({
            "id": deal_id,
            "fields": { field: value },
        });
        let request = self.client.post(self.method_url(method)).json(&payload);
        let envelope: Envelope<Value> = self.call(method, request).await?;
        let result = envelope.result.unwrap_or(Value::Null);
        info!(
            deal_id,
            field,
            value,
            ok = result.as_bool().unwrap_or(false),
            "deal field updated"
        );
        Ok(result)
    }
}
