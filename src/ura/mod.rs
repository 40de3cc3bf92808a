//! Decides whether a caller went through the IVR (URA) and records it on the deal.
//!
//! The pipeline is strictly sequential: deal → phone from title → call
//! activity → evidence → field update. Every branch that lacks data resolves to
//! "No" and still writes the field; only a missing deal or an upstream failure
//! ends the request without a write.
use crate::config::{ActivityScope, Config, LookbackAnchor};
use crate::crm::{ActivityQuery, CallActivity, CrmApi, Deal};
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

pub mod evidence;
pub mod phone;
pub mod selector;

use evidence::EvidenceSource;
use phone::{Phone, TitlePattern};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    #[serde(rename = "Sim")]
    Yes,
    #[serde(rename = "Não")]
    No,
}

impl From<bool> for Verdict {
    fn from(passed: bool) -> Self {
        if passed {
            Verdict::Yes
        } else {
            Verdict::No
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    ToneReceived,
    NoToneReceived,
    MissedCallFlag,
    FallbackMissedCallFlag,
    PhoneNotFound,
    NoMatchingActivity,
    CallStatsNotFound,
    CallLogUnavailable,
}

impl Reason {
    /// Text shown to CRM users in the `motivo` field.
    pub fn motivo(&self) -> &'static str {
        match self {
            Reason::ToneReceived => "Tom DTMF recebido na URA",
            Reason::NoToneReceived => "Nenhum tom DTMF recebido",
            Reason::MissedCallFlag => "Indicador MISSED_CALL da atividade",
            Reason::FallbackMissedCallFlag => "Sem CALL_ID, usado indicador MISSED_CALL",
            Reason::PhoneNotFound => "Telefone não encontrado no título",
            Reason::NoMatchingActivity => "Nenhuma atividade encontrada",
            Reason::CallStatsNotFound => "Estatística da chamada não encontrada",
            Reason::CallLogUnavailable => "Log da chamada indisponível",
        }
    }

    fn status(&self) -> &'static str {
        match self {
            Reason::PhoneNotFound => "phone_not_found",
            _ => "ok",
        }
    }
}

/// Outcome of one verification, serialized as the webhook response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub status: &'static str,
    pub deal_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(rename = "passouURA")]
    pub verdict: Verdict,
    pub motivo: &'static str,
    pub reason: Reason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub update_result: Value,
}

#[derive(Debug, Default)]
struct Finding {
    phone: Option<String>,
    activity_id: Option<String>,
    call_id: Option<String>,
}

/// Enumerated values of the deal's "passou pela URA" field.
#[derive(Debug, Clone)]
struct FieldMapping {
    code: String,
    yes: String,
    no: String,
}

impl FieldMapping {
    fn value(&self, verdict: Verdict) -> &str {
        match verdict {
            Verdict::Yes => &self.yes,
            Verdict::No => &self.no,
        }
    }
}

pub struct Classifier {
    crm: Arc<dyn CrmApi>,
    title: TitlePattern,
    evidence: Box<dyn EvidenceSource>,
    field: FieldMapping,
    lookback: Duration,
    anchor: LookbackAnchor,
    suffix_len: usize,
    deal_owner_type_id: Option<u32>,
    fallback_scopes: Vec<ActivityScope>,
}

impl Classifier {
    pub fn new(crm: Arc<dyn CrmApi>, config: &Config) -> anyhow::Result<Self> {
        let classifier = &config.classifier;
        Ok(Self {
            crm,
            title: TitlePattern::new(&classifier.title_pattern)?,
            evidence: evidence::from_config(classifier),
            field: FieldMapping {
                code: config.bitrix.ura_field_code.clone(),
                yes: config.bitrix.yes_enum_code.clone(),
                no: config.bitrix.no_enum_code.clone(),
            },
            lookback: Duration::minutes(classifier.lookback_minutes),
            anchor: classifier.lookback_anchor,
            suffix_len: classifier.phone_suffix_len,
            deal_owner_type_id: classifier.deal_owner_type_id,
            fallback_scopes: classifier.fallback_scopes.clone(),
        })
    }

    pub async fn classify(&self, deal_id: &str) -> Result<Classification> {
        let deal_id = deal_id.trim();
        if deal_id.is_empty() {
            return Err(Error::MissingIdentifier);
        }

        let deal = self
            .crm
            .get_deal(deal_id)
            .await?
            .ok_or_else(|| Error::DealNotFound(deal_id.to_string()))?;
        info!(deal_id, title = deal.title(), "deal loaded");

        let Some(phone) = self.title.extract(deal.title()) else {
            warn!(deal_id, title = deal.title(), "phone not found in deal title");
            return self
                .persist(deal_id, Finding::default(), Verdict::No, Reason::PhoneNotFound)
                .await;
        };
        info!(deal_id, phone = %phone.raw, digits = %phone.digits, "phone extracted");

        let mut finding = Finding {
            phone: Some(phone.raw.clone()),
            ..Default::default()
        };

        let Some(activity) = self.find_activity(deal_id, &deal, &phone).await? else {
            info!(deal_id, phone = %phone.raw, "no call activity matches the phone");
            return self
                .persist(deal_id, finding, Verdict::No, Reason::NoMatchingActivity)
                .await;
        };
        finding.activity_id = Some(activity.id.clone());

        let evidence = self.evidence.gather(self.crm.as_ref(), &activity).await?;
        finding.call_id = evidence.call_id;
        let (verdict, reason) = evidence.signal.verdict();
        self.persist(deal_id, finding, verdict, reason).await
    }

    fn scopes(&self, deal_id: &str) -> Vec<ActivityScope> {
        let own = self.deal_owner_type_id.map(|owner_type_id| ActivityScope {
            owner_type_id,
            owner_id: deal_id.to_string(),
        });
        own.into_iter()
            .chain(self.fallback_scopes.iter().cloned())
            .collect()
    }

    async fn find_activity(
        &self,
        deal_id: &str,
        deal: &Deal,
        phone: &Phone,
    ) -> Result<Option<CallActivity>> {
        let now = Utc::now().fixed_offset();
        let reference = deal.created_at().unwrap_or(now);
        let anchor: DateTime<FixedOffset> = match self.anchor {
            LookbackAnchor::DealCreated => reference,
            LookbackAnchor::Now => now,
        };
        let created_after = anchor - self.lookback;
        let suffix = phone.suffix(self.suffix_len);

        for scope in self.scopes(deal_id) {
            let query = ActivityQuery {
                owner_type_id: scope.owner_type_id,
                owner_id: scope.owner_id,
                created_after,
            };
            let candidates = self.crm.list_call_activities(&query).await?;
            if let Some(activity) = selector::select_closest(&candidates, suffix, reference) {
                info!(
                    deal_id,
                    owner_type_id = query.owner_type_id,
                    owner_id = %query.owner_id,
                    activity_id = %activity.id,
                    candidates = candidates.len(),
                    "call activity matched"
                );
                return Ok(Some(activity.clone()));
            }
        }
        Ok(None)
    }

    async fn persist(
        &self,
        deal_id: &str,
        finding: Finding,
        verdict: Verdict,
        reason: Reason,
    ) -> Result<Classification> {
        let value = self.field.value(verdict);
        let update_result = self
            .crm
            .update_deal_field(deal_id, &self.field.code, value)
            .await?;
        info!(
            deal_id,
            verdict = ?verdict,
            reason = ?reason,
            activity_id = finding.activity_id.as_deref().unwrap_or("-"),
            call_id = finding.call_id.as_deref().unwrap_or("-"),
            "URA verification recorded"
        );
        Ok(Classification {
            status: reason.status(),
            deal_id: deal_id.to_string(),
            phone: finding.phone,
            verdict,
            motivo: reason.motivo(),
            reason,
            activity_id: finding.activity_id,
            call_id: finding.call_id,
            update_result,
        })
    }
}
