use crate::crm::digits_only;
use anyhow::{anyhow, Result};
use regex::Regex;

/// Phone number as written in a deal title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phone {
    pub raw: String,
    pub digits: String,
}

impl Phone {
    /// Last `len` digits, or all of them for shorter numbers.
    pub fn suffix(&self, len: usize) -> &str {
        let start = self.digits.len().saturating_sub(len);
        &self.digits[start..]
    }
}

/// The deal title convention `"<prefix> - <phone> - Chamada ..."`.
#[derive(Debug, Clone)]
pub struct TitlePattern {
    regex: Regex,
}

impl TitlePattern {
    /// The first capture group of `pattern` is the phone.
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)?;
        if regex.captures_len() < 2 {
            return Err(anyhow!("title pattern `{}` has no capture group", pattern));
        }
        Ok(Self { regex })
    }

    pub fn extract(&self, title: &str) -> Option<Phone> {
        let raw = self.regex.captures(title)?.get(1)?.as_str().trim();
        let digits = digits_only(raw);
        if digits.is_empty() {
            return None;
        }
        Some(Phone {
            raw: raw.to_string(),
            digits,
        })
    }
}
