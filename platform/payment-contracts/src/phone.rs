use serde::{Deserialize, Serialize};

use crate::ContractError;

/// Calling codes of the markets served by the supported providers.
/// Longest codes first so prefix matching is unambiguous.
const CALLING_CODES: &[&str] = &["254", "255", "256", "250", "234", "233", "260", "265", "27"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneNumber {
    pub country_code: String,
    pub national_number: String,
    pub formatted: String,
}

impl PhoneNumber {
    /// Parse a phone number from raw provider input.
    ///
    /// Non-digit characters are dropped. A leading `0` is replaced with
    /// `default_country_code`; a bare national number (no calling code) is
    /// prefixed with it as well.
    pub fn parse(raw: &str, default_country_code: Option<&str>) -> Result<Self, ContractError> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() < 9 || digits.len() > 15 {
            return Err(ContractError::InvalidPhone(raw.to_string()));
        }

        let international = if let Some(national) = digits.strip_prefix('0') {
            let cc = default_country_code
                .ok_or_else(|| ContractError::InvalidPhone(raw.to_string()))?;
            format!("{cc}{national}")
        } else if CALLING_CODES.iter().any(|cc| digits.starts_with(cc)) {
            digits
        } else if let Some(cc) = default_country_code {
            format!("{cc}{digits}")
        } else {
            return Err(ContractError::InvalidPhone(raw.to_string()));
        };

        let country_code = CALLING_CODES
            .iter()
            .find(|cc| international.starts_with(*cc))
            .ok_or_else(|| ContractError::InvalidPhone(raw.to_string()))?;

        let national_number = international[country_code.len()..].to_string();
        if national_number.len() < 7 {
            return Err(ContractError::InvalidPhone(raw.to_string()));
        }

        Ok(Self {
            country_code: country_code.to_string(),
            formatted: format!("+{} {}", country_code, national_number),
            national_number,
        })
    }

    /// E.164 form without separators, e.g. `+254712345678`
    pub fn e164(&self) -> String {
        format!("+{}{}", self.country_code, self.national_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_international_number() {
        let p = PhoneNumber::parse("254708374149", None).unwrap();
        assert_eq!(p.country_code, "254");
        assert_eq!(p.national_number, "708374149");
        assert_eq!(p.formatted, "+254 708374149");
        assert_eq!(p.e164(), "+254708374149");
    }

    #[test]
    fn test_parse_local_number_with_default_country() {
        let p = PhoneNumber::parse("0803 123 4567", Some("234")).unwrap();
        assert_eq!(p.country_code, "234");
        assert_eq!(p.national_number, "8031234567");
    }

    #[test]
    fn test_parse_two_digit_calling_code() {
        let p = PhoneNumber::parse("+27 82 123 4567", None).unwrap();
        assert_eq!(p.country_code, "27");
        assert_eq!(p.national_number, "821234567");
    }

    #[test]
    fn test_parse_rejects_local_without_default() {
        assert!(PhoneNumber::parse("0712345678", None).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        assert!(PhoneNumber::parse("12345", Some("254")).is_err());
        assert!(PhoneNumber::parse("1234567890123456", Some("254")).is_err());
    }
}
