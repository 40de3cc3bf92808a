use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_URA_FIELD: &str = "UF_CRM_1772056801";
const DEFAULT_PROVIDER_ID: &str = "VOXIMPLANT_CALL";
/// Text between the last two `" - "` separators before `Chamada`.
pub const DEFAULT_TITLE_PATTERN: &str = r"^.*- (.+?) - Chamada";
pub const DEFAULT_TONE_MARKER: &str = "Call.ToneReceived";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub http_addr: String,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    /// Request paths excluded from the access log, `*` suffix matches a prefix.
    pub access_log_skip: Vec<String>,
    pub bitrix: BitrixConfig,
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BitrixConfig {
    /// Inbound webhook base, e.g. `https://example.bitrix24.com.br/rest/1/secret`.
    pub webhook_url: String,
    pub ura_field_code: String,
    pub yes_enum_code: String,
    pub no_enum_code: String,
    pub provider_id: String,
    pub timeout_ms: Option<u64>,
    pub useragent: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStrategy {
    #[default]
    ToneLog,
    MissedCallFlag,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LookbackAnchor {
    #[default]
    DealCreated,
    Now,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ActivityScope {
    pub owner_type_id: u32,
    pub owner_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub evidence: EvidenceStrategy,
    pub lookback_minutes: i64,
    pub lookback_anchor: LookbackAnchor,
    pub phone_suffix_len: usize,
    pub title_pattern: String,
    pub tone_marker: String,
    pub origin_prefix: String,
    /// Owner type of deals in `crm.activity.list`; `None` skips the deal scope.
    pub deal_owner_type_id: Option<u32>,
    /// Searched in order after the deal itself.
    pub fallback_scopes: Vec<ActivityScope>,
}

impl Default for BitrixConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            ura_field_code: DEFAULT_URA_FIELD.to_string(),
            yes_enum_code: "Sim".to_string(),
            no_enum_code: "Não".to_string(),
            provider_id: DEFAULT_PROVIDER_ID.to_string(),
            timeout_ms: Some(10_000),
            useragent: None,
        }
    }
}

impl BitrixConfig {
    /// Webhook base without the trailing slash, ready for `{base}/{method}`.
    pub fn webhook_base(&self) -> &str {
        self.webhook_url.trim().trim_end_matches('/')
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            evidence: EvidenceStrategy::default(),
            lookback_minutes: 120,
            lookback_anchor: LookbackAnchor::default(),
            phone_suffix_len: 8,
            title_pattern: DEFAULT_TITLE_PATTERN.to_string(),
            tone_marker: DEFAULT_TONE_MARKER.to_string(),
            origin_prefix: "VI_".to_string(),
            deal_owner_type_id: Some(2),
            fallback_scopes: vec![ActivityScope {
                owner_type_id: 14,
                owner_id: "655".to_string(),
            }],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            log_level: Some("info".to_string()),
            log_file: None,
            access_log_skip: vec!["/health".to_string()],
            bitrix: BitrixConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| anyhow!("{}: {}", e, path))?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// `BITRIX_WEBHOOK_URL`, `URA_FIELD_CODE` and `HTTP_ADDR` win over the file.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = lookup("BITRIX_WEBHOOK_URL") {
            self.bitrix.webhook_url = url;
        }
        if let Some(code) = lookup("URA_FIELD_CODE") {
            self.bitrix.ura_field_code = code;
        }
        if let Some(addr) = lookup("HTTP_ADDR") {
            self.http_addr = addr;
        }
    }
}
