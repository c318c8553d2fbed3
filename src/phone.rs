use crate::errors::HfpError;

/// Longest dial string we pass to `ATD`.
pub const MAX_NUMBER_LEN: usize = 32;

/// Strip a `tel:` scheme and visual separators, leaving a dialable string.
///
/// `tel:+1-555-0000` → `+15550000`. URI parameters (`;phone-context=…`)
/// are dropped.
pub fn normalize_dial_string(input: &str) -> String {
    let trimmed = input.trim();
    let body = trimmed
        .strip_prefix("tel:")
        .or_else(|| trimmed.strip_prefix("TEL:"))
        .unwrap_or(trimmed);
    let body = body.trim_start_matches("//");
    let body = body.split(';').next().unwrap_or_default();

    body.chars()
        .filter(|c| !matches!(c, '-' | ' ' | '.' | '(' | ')'))
        .collect()
}

/// Accepts digits plus `+ * #`, 1–32 characters, `+` only in front.
pub fn validate_phone(number: &str) -> Result<(), HfpError> {
    let digits_only = number.strip_prefix('+').unwrap_or(number);
    let chars_ok = digits_only
        .chars()
        .all(|c| c.is_ascii_digit() || c == '*' || c == '#');
    let len_ok = !digits_only.is_empty() && number.len() <= MAX_NUMBER_LEN;

    if !chars_ok || !len_ok {
        return Err(HfpError::InvalidPhoneNumber(number.to_string()));
    }
    Ok(())
}

/// Normalize and validate in one go.
pub fn parse_dial_target(input: &str) -> Result<String, HfpError> {
    let number = normalize_dial_string(input);
    validate_phone(&number).map_err(|_| HfpError::InvalidPhoneNumber(input.to_string()))?;
    Ok(number)
}

/// Comparison key for matching numbers written with and without a country
/// prefix: the last 10 digits.
pub fn match_key(number: &str) -> String {
    let digits: Vec<char> = number.chars().filter(char::is_ascii_digit).collect();
    let start = digits.len().saturating_sub(10);
    digits[start..].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tel_uri_is_normalized() {
        assert_eq!(normalize_dial_string("tel:+1-555-0000"), "+15550000");
        assert_eq!(normalize_dial_string(" tel:(555) 123.4567 "), "5551234567");
        assert_eq!(normalize_dial_string("tel:911;phone-context=+1"), "911");
        assert_eq!(normalize_dial_string("5550000"), "5550000");
    }

    #[test]
    fn validation_accepts_service_codes() {
        validate_phone("+905551234567").unwrap();
        validate_phone("*#06#").unwrap();
        validate_phone("112").unwrap();
    }

    #[test]
    fn validation_rejects_junk() {
        assert!(validate_phone("").is_err());
        assert!(validate_phone("+").is_err());
        assert!(validate_phone("55a123").is_err());
        assert!(validate_phone("1+2").is_err());
        assert!(validate_phone(&"1".repeat(MAX_NUMBER_LEN + 1)).is_err());
    }

    #[test]
    fn parse_dial_target_reports_raw_input() {
        match parse_dial_target("tel:abc") {
            Err(HfpError::InvalidPhoneNumber(s)) => assert_eq!(s, "tel:abc"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn match_key_ignores_country_prefix() {
        assert_eq!(match_key("+905551234567"), match_key("05551234567"));
        assert_eq!(match_key("12345"), "12345");
    }
}
