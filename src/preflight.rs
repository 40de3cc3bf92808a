use crate::config::Config;
use crate::ura::phone::TitlePattern;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use tokio::net::TcpListener;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct PreflightIssue {
    pub field: String,
    pub message: String,
}

impl PreflightIssue {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub struct PreflightError {
    pub issues: Vec<PreflightIssue>,
}

impl PreflightError {
    pub fn new(issues: Vec<PreflightIssue>) -> Self {
        Self { issues }
    }
}

impl fmt::Display for PreflightError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration has {} issue(s)", self.issues.len())?;
        for issue in &self.issues {
            write!(f, "\n  {}: {}", issue.field, issue.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for PreflightError {}

/// Checks that need no network: the values a request depends on.
pub fn validate_config(config: &Config) -> Vec<PreflightIssue> {
    let mut issues = Vec::new();

    let webhook = config.bitrix.webhook_url.trim();
    if webhook.is_empty() {
        issues.push(PreflightIssue::new(
            "bitrix.webhook_url",
            "Missing webhook url (set it in the file or BITRIX_WEBHOOK_URL)",
        ));
    } else {
        match url::Url::parse(webhook) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => issues.push(PreflightIssue::new(
                "bitrix.webhook_url",
                format!("Unsupported scheme `{}`", url.scheme()),
            )),
            Err(err) => issues.push(PreflightIssue::new(
                "bitrix.webhook_url",
                format!("Invalid url ({})", err),
            )),
        }
    }

    for (field, value) in [
        ("bitrix.ura_field_code", &config.bitrix.ura_field_code),
        ("bitrix.yes_enum_code", &config.bitrix.yes_enum_code),
        ("bitrix.no_enum_code", &config.bitrix.no_enum_code),
        ("classifier.tone_marker", &config.classifier.tone_marker),
    ] {
        if value.trim().is_empty() {
            issues.push(PreflightIssue::new(field, "Must not be empty"));
        }
    }
    if config.bitrix.yes_enum_code == config.bitrix.no_enum_code {
        issues.push(PreflightIssue::new(
            "bitrix.no_enum_code",
            "Yes and no codes must differ",
        ));
    }

    if config.classifier.lookback_minutes <= 0 {
        issues.push(PreflightIssue::new(
            "classifier.lookback_minutes",
            format!("Must be positive, got {}", config.classifier.lookback_minutes),
        ));
    }
    if config.classifier.phone_suffix_len == 0 {
        issues.push(PreflightIssue::new(
            "classifier.phone_suffix_len",
            "Must be positive",
        ));
    }
    if let Err(err) = TitlePattern::new(&config.classifier.title_pattern) {
        issues.push(PreflightIssue::new(
            "classifier.title_pattern",
            err.to_string(),
        ));
    }

    if let Err(issue) = value_as_socket_addr("http_addr", &config.http_addr) {
        issues.push(issue);
    }
    issues
}

/// Full startup check: [`validate_config`] plus binding the HTTP address.
pub async fn validate_start(config: &Config) -> Result<(), PreflightError> {
    let mut issues = validate_config(config);

    if let Ok(addr) = value_as_socket_addr("http_addr", &config.http_addr) {
        if let Err(err) = TcpListener::bind(addr).await.map(drop) {
            issues.push(PreflightIssue::new(
                "http_addr",
                format!("Address {} is unavailable ({})", addr, err),
            ));
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(PreflightError::new(issues))
    }
}

fn value_as_socket_addr(field: &str, value: &str) -> Result<SocketAddr, PreflightIssue> {
    value.parse::<SocketAddr>().map_err(|err| {
        PreflightIssue::new(field, format!("Invalid {} `{}` ({})", field, value, err))
    })
}
