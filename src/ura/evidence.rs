use super::{Reason, Verdict};
use crate::config::{ClassifierConfig, EvidenceStrategy};
use crate::crm::{CallActivity, CrmApi};
use crate::error::Result;
use async_trait::async_trait;
use tracing::{debug, info};

/// What the call telemetry says about the IVR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// The call log was scanned; `true` when a DTMF tone was received.
    Tone(bool),
    /// Only the activity's missed-call flag was available.
    MissedCall { missed: bool, fallback: bool },
    /// Not enough data; resolves to "No".
    Unknown(Reason),
}

impl Signal {
    pub fn verdict(&self) -> (Verdict, Reason) {
        match self {
            Signal::Tone(true) => (Verdict::Yes, Reason::ToneReceived),
            Signal::Tone(false) => (Verdict::No, Reason::NoToneReceived),
            Signal::MissedCall { missed, fallback } => {
                let reason = if *fallback {
                    Reason::FallbackMissedCallFlag
                } else {
                    Reason::MissedCallFlag
                };
                (Verdict::from(*missed), reason)
            }
            Signal::Unknown(reason) => (Verdict::No, *reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evidence {
    pub signal: Signal,
    pub call_id: Option<String>,
}

/// Call-log event name written when the caller presses a key.
#[derive(Debug, Clone)]
pub struct ToneMarker(String);

impl ToneMarker {
    pub fn new(marker: impl Into<String>) -> Self {
        Self(marker.into())
    }

    pub fn found_in(&self, log: &str) -> bool {
        log.contains(self.0.as_str())
    }
}

#[async_trait]
pub trait EvidenceSource: Send + Sync {
    async fn gather(&self, crm: &dyn CrmApi, activity: &CallActivity) -> Result<Evidence>;
}

pub fn from_config(config: &ClassifierConfig) -> Box<dyn EvidenceSource> {
    match config.evidence {
        EvidenceStrategy::ToneLog => Box::new(ToneLogEvidence {
            marker: ToneMarker::new(config.tone_marker.clone()),
            origin_prefix: config.origin_prefix.clone(),
        }),
        EvidenceStrategy::MissedCallFlag => Box::new(MissedCallEvidence {
            origin_prefix: config.origin_prefix.clone(),
        }),
    }
}

/// Looks the call up in the telephony statistics and scans its event log.
pub struct ToneLogEvidence {
    pub marker: ToneMarker,
    pub origin_prefix: String,
}

#[async_trait]
impl EvidenceSource for ToneLogEvidence {
    async fn gather(&self, crm: &dyn CrmApi, activity: &CallActivity) -> Result<Evidence> {
        let Some(call_id) = activity.call_id(&self.origin_prefix) else {
            info!(
                activity_id = %activity.id,
                missed_call = activity.missed_call(),
                "activity has no origin id, falling back to missed-call flag"
            );
            return Ok(Evidence {
                signal: Signal::MissedCall {
                    missed: activity.missed_call(),
                    fallback: true,
                },
                call_id: None,
            });
        };

        let Some(stats) = crm.get_call_statistic(&call_id).await? else {
            info!(call_id = %call_id, "call statistics not found");
            return Ok(Evidence {
                signal: Signal::Unknown(Reason::CallStatsNotFound),
                call_id: Some(call_id),
            });
        };

        let Some(log_url) = stats.log_url() else {
            info!(call_id = %call_id, "call statistics carry no log");
            return Ok(Evidence {
                signal: Signal::Unknown(Reason::CallLogUnavailable),
                call_id: Some(call_id),
            });
        };

        let log = crm.fetch_call_log(log_url).await?;
        let tone = self.marker.found_in(&log);
        debug!(
            call_id = %call_id,
            duration = %stats.call_duration,
            log_len = log.len(),
            tone,
            "call log scanned"
        );
        Ok(Evidence {
            signal: Signal::Tone(tone),
            call_id: Some(call_id),
        })
    }
}

/// The legacy heuristic: trust `SETTINGS.MISSED_CALL` alone.
pub struct MissedCallEvidence {
    pub origin_prefix: String,
}

#[async_trait]
impl EvidenceSource for MissedCallEvidence {
    async fn gather(&self, _crm: &dyn CrmApi, activity: &CallActivity) -> Result<Evidence> {
        Ok(Evidence {
            signal: Signal::MissedCall {
                missed: activity.missed_call(),
                fallback: false,
            },
            call_id: activity.call_id(&self.origin_prefix),
        })
    }
}
