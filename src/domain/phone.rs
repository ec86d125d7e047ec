use crate::error::PaymentError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A mobile-money capable subscriber number in international format
/// without the leading `+` (e.g. `254712345678`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Msisdn(String);

const COUNTRY_CODE: &str = "254";

impl Msisdn {
    /// Normalises the common local spellings (`07..`, `01..`, `+2547..`,
    /// `2547..`, `7..`) into `2547XXXXXXXX` / `2541XXXXXXXX`.
    pub fn parse(raw: &str) -> Result<Self, PaymentError> {
        let digits: String = raw
            .trim()
            .trim_start_matches('+')
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect();

        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid(raw));
        }

        let subscriber = if let Some(rest) = digits.strip_prefix(COUNTRY_CODE) {
            rest
        } else if let Some(rest) = digits.strip_prefix('0') {
            rest
        } else {
            digits.as_str()
        };

        if subscriber.len() != 9 || !(subscriber.starts_with('7') || subscriber.starts_with('1')) {
            return Err(invalid(raw));
        }

        Ok(Self(format!("{COUNTRY_CODE}{subscriber}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn invalid(raw: &str) -> PaymentError {
    PaymentError::ValidationError(format!("'{raw}' is not a valid mobile-money number"))
}

impl FromStr for Msisdn {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Msisdn {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Msisdn> for String {
    fn from(msisdn: Msisdn) -> Self {
        msisdn.0
    }
}

impl fmt::Display for Msisdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
