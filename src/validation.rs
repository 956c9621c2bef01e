/// Input validation and normalization shared by the entity constructors.
///
/// - Email format checks
/// - Phone parsing and E.164 normalization (Spain as default region)
/// - Postal code and free-text token normalization used by provider matching
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use regex::Regex;
use std::sync::OnceLock;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Region used to interpret phone numbers written without a country prefix.
pub const DEFAULT_PHONE_REGION: CountryId = CountryId::ES;

fn email_regex() -> &'static Regex {
    static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();
    EMAIL_REGEX.get_or_init(|| {
        // RFC 5322 simplified: local@domain.tld
        Regex::new(
            r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$",
        )
        .expect("email regex is valid")
    })
}

/// Validate an email address.
///
/// Checks for:
/// - Basic email format (contains @ and a dotted domain)
/// - Minimum length requirements
pub fn is_valid_email(email: &str) -> bool {
    if email.len() < 5 || !email.contains('@') || !email.contains('.') {
        return false;
    }

    if !email_regex().is_match(email) {
        tracing::debug!("Invalid email format");
        return false;
    }

    true
}

/// Parse a phone number and return it in E.164 format (`+34612345678`).
///
/// Numbers without an international prefix are interpreted in
/// [`DEFAULT_PHONE_REGION`]. Returns `None` for anything libphonenumber
/// does not consider a valid number.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() < 8 {
        return None;
    }

    match phonenumber::parse(Some(DEFAULT_PHONE_REGION), trimmed) {
        Ok(number) if phonenumber::is_valid(&number) => {
            let formatted = number.format().mode(Mode::E164).to_string();
            tracing::debug!("Valid phone normalized to {}", mask_phone(&formatted));
            Some(formatted)
        }
        Ok(_) => {
            tracing::debug!("Phone number failed validity check");
            None
        }
        Err(e) => {
            tracing::debug!("Failed to parse phone: {:?}", e);
            None
        }
    }
}

/// Keep only the digits of a postal code.
pub fn normalize_postal_code(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Spanish postal codes are exactly five digits.
pub fn is_valid_postal_code(code: &str) -> bool {
    code.len() == 5 && code.chars().all(|c| c.is_ascii_digit())
}

/// Case- and diacritic-insensitive form of a free-text token.
///
/// `"  Málaga "` and `"MALAGA"` both normalize to `"malaga"`.
pub fn normalize_token(raw: &str) -> String {
    raw.trim()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Hide all but the last three digits of a phone number for logging.
pub fn mask_phone(phone: &str) -> String {
    let visible = 3.min(phone.len());
    let (hidden, tail) = phone.split_at(phone.len() - visible);
    format!("{}{}", "*".repeat(hidden.chars().count()), tail)
}

/// Constant-time string comparison for secrets (admin token, OTP hashes).
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.as_bytes()
        .iter()
        .zip(b.as_bytes().iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
