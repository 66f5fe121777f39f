//! Phone-number canonicalization.
//!
//! The canonical form is a `+` followed by digits only, with the country code
//! included. It is the natural key of the local contacts table, so two device
//! entries that differ only in formatting collapse to one contact.

/// Canonicalize a raw address-book phone number.
///
/// * `+` prefixed numbers keep their country code as written.
/// * `00` international prefixes are rewritten to `+`.
/// * National numbers get `default_country_code` prepended after dropping
///   their trunk `0`. Without a default they are taken as already
///   international.
///
/// Returns `None` when the input contains no digits at all.
pub fn canonicalize_phone(raw: &str, default_country_code: Option<&str>) -> Option<String> {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }

    if trimmed.starts_with('+') {
        return Some(format!("+{digits}"));
    }

    if let Some(rest) = digits.strip_prefix("00") {
        if rest.is_empty() {
            return None;
        }
        return Some(format!("+{rest}"));
    }

    let country_code: Option<String> = default_country_code
        .map(|cc| cc.chars().filter(char::is_ascii_digit).collect::<String>())
        .filter(|cc| !cc.is_empty());

    match country_code {
        Some(cc) => {
            let national = digits.trim_start_matches('0');
            if national.is_empty() {
                return None;
            }
            Some(format!("+{cc}{national}"))
        }
        None => Some(format!("+{digits}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatting_is_stripped() {
        assert_eq!(
            canonicalize_phone("+1 (555) 000-1", None).as_deref(),
            Some("+15550001")
        );
    }

    #[test]
    fn test_international_prefix() {
        assert_eq!(
            canonicalize_phone("0044 20 7946 0000", Some("1")).as_deref(),
            Some("+442079460000")
        );
    }

    #[test]
    fn test_national_number_gets_default_country_code() {
        assert_eq!(
            canonicalize_phone("020 7946 0000", Some("+44")).as_deref(),
            Some("+442079460000")
        );
    }

    #[test]
    fn test_no_digits() {
        assert_eq!(canonicalize_phone("", None), None);
        assert_eq!(canonicalize_phone("n/a", Some("44")), None);
        assert_eq!(canonicalize_phone("00", None), None);
    }

    #[test]
    fn test_same_number_different_formatting_collides() {
        let a = canonicalize_phone("+15550001", None);
        let b = canonicalize_phone("+1 555 0001", None);
        assert_eq!(a, b);
    }
}
