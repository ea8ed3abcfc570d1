//! Helpers for comparing Bluetooth UUIDs in short (16-bit) and long
//! (128-bit) string form.
//!
//! A short id only matches a long UUID when it sits at positions 4..8 of the
//! long form; the same hex digits anywhere else in the string must not match.

/// Bluetooth Base UUID tail appended to every expanded 16-bit id
const BASE_UUID_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

fn is_short_form(s: &str) -> bool {
    s.len() == 4 && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_long_form(s: &str) -> bool {
    if s.len() != 36 {
        return false;
    }
    s.char_indices().all(|(i, c)| match i {
        8 | 13 | 18 | 23 => c == '-',
        _ => c.is_ascii_hexdigit(),
    })
}

/// Extract the 16-bit short id embedded in a long UUID, if well-formed.
fn short_of_long(s: &str) -> Option<&str> {
    if is_long_form(s) {
        Some(&s[4..8])
    } else {
        None
    }
}

/// Compare two Bluetooth UUIDs, accepting any mix of short and long forms.
///
/// Matching is case-insensitive and symmetric. A short id is compared against
/// the embedded short id of a long form only; it never matches as a substring
/// at any other position.
#[must_use]
pub fn uuid_match(a: &str, b: &str) -> bool {
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();

    match (is_short_form(&a), is_short_form(&b)) {
        (true, true) => a == b,
        (true, false) => short_of_long(&b) == Some(a.as_str()),
        (false, true) => short_of_long(&a) == Some(b.as_str()),
        (false, false) => is_long_form(&a) && is_long_form(&b) && a == b,
    }
}

/// Expand a 16-bit short id into the full 128-bit Bluetooth UUID string.
///
/// Output is always 36 characters, lowercase, with the short id zero-padded
/// into positions 4..8: `0000XXXX-0000-1000-8000-00805f9b34fb`.
#[must_use]
pub fn to_full_uuid(short: &str) -> String {
    format!("0000{:0>4}{BASE_UUID_SUFFIX}", short.to_ascii_lowercase())
}
