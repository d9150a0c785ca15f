// Identity display helpers: stable per-user colors, initials, display names.

/// Fixed palette used for cursors, avatars and selection highlights.
pub const USER_COLORS: [&str; 10] = [
    "#e06c75", "#61afef", "#98c379", "#c678dd", "#e5c07b", "#56b6c2", "#d19a66", "#be5046",
    "#7ec8a4", "#f472b6",
];

pub const UNKNOWN_INITIALS: &str = "??";
pub const ANONYMOUS_NAME: &str = "Anonymous";

/// Deterministic color for a user id.
///
/// Rolling `hash * 31 + code_unit` over the UTF-16 code units of `user_id`
/// in wrapping 32-bit arithmetic, reduced modulo the palette size. Matches
/// the string hash used by the browser client.
pub fn color_for_user(user_id: &str) -> &'static str {
    let hash = user_id.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_mul(31).wrapping_add(i32::from(unit))
    });
    let index = hash.unsigned_abs() as usize % USER_COLORS.len();
    USER_COLORS[index]
}

/// Two-letter avatar initials.
pub fn initials_for(name: Option<&str>, email: Option<&str>) -> String {
    let parts: Vec<&str> = name.map(|n| n.split_whitespace().collect()).unwrap_or_default();
    match parts.as_slice() {
        [] => {}
        [only] => return leading_upper(only, 2),
        [first, .., last] => {
            let mut initials = leading_upper(first, 1);
            initials.push_str(&leading_upper(last, 1));
            return initials;
        }
    }

    match email.map(str::trim).filter(|e| !e.is_empty()) {
        Some(email) => leading_upper(email, 2),
        None => UNKNOWN_INITIALS.to_string(),
    }
}

/// Human-facing name: explicit name, else email local part, else the sentinel.
pub fn display_name_for(name: Option<&str>, email: Option<&str>) -> String {
    if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
        return name.to_string();
    }

    match email.filter(|e| !e.is_empty()) {
        Some(email) => match email.split_once('@') {
            Some((local, _)) if !local.is_empty() => local.to_string(),
            _ => email.to_string(),
        },
        None => ANONYMOUS_NAME.to_string(),
    }
}

fn leading_upper(value: &str, count: usize) -> String {
    value.chars().take(count).flat_map(char::to_uppercase).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    // ── Colors ─────────────────────────────────────────────────────

    #[test]
    fn palette_has_no_duplicates() {
        let unique: HashSet<&str> = USER_COLORS.iter().copied().collect();
        assert_eq!(unique.len(), USER_COLORS.len());
        assert!(USER_COLORS.len() >= 6);
    }

    #[test]
    fn palette_entries_are_hex_colors() {
        for color in USER_COLORS {
            assert_eq!(color.len(), 7, "{color} should be #rrggbb");
            assert!(color.starts_with('#'));
            assert!(color[1..].chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn sample_users_get_distinct_colors() {
        let colors: HashSet<&str> = ["user-alice", "user-bob", "user-carla", "user-dmitri"]
            .iter()
            .map(|id| color_for_user(id))
            .collect();
        assert!(colors.len() >= 2);
    }

    #[test]
    fn empty_user_id_maps_to_first_color() {
        assert_eq!(color_for_user(""), USER_COLORS[0]);
    }

    proptest! {
        #[test]
        fn color_is_deterministic_and_in_palette(user_id in ".{0,64}") {
            let first = color_for_user(&user_id);
            prop_assert_eq!(first, color_for_user(&user_id));
            prop_assert!(USER_COLORS.contains(&first));
        }
    }

    // ── Initials ───────────────────────────────────────────────────

    #[test]
    fn initials_from_full_names() {
        assert_eq!(initials_for(Some("John Doe"), None), "JD");
        assert_eq!(initials_for(Some("Mary Jane Watson Parker"), None), "MP");
        assert_eq!(initials_for(Some("  ada   lovelace "), None), "AL");
    }

    #[test]
    fn initials_from_single_name() {
        assert_eq!(initials_for(Some("John"), None), "JO");
        assert_eq!(initials_for(Some("x"), None), "X");
    }

    #[test]
    fn initials_fall_back_to_email_then_sentinel() {
        assert_eq!(initials_for(None, Some("jane@x.com")), "JA");
        assert_eq!(initials_for(Some("   "), Some("jane@x.com")), "JA");
        assert_eq!(initials_for(None, None), "??");
        assert_eq!(initials_for(None, Some("")), "??");
    }

    // ── Display names ──────────────────────────────────────────────

    #[test]
    fn display_name_prefers_name() {
        assert_eq!(display_name_for(Some("Jane"), Some("jane@x.com")), "Jane");
    }

    #[test]
    fn display_name_uses_email_local_part() {
        assert_eq!(display_name_for(None, Some("john@example.com")), "john");
        assert_eq!(display_name_for(Some(""), Some("john@example.com")), "john");
    }

    #[test]
    fn display_name_keeps_email_without_local_part() {
        assert_eq!(display_name_for(None, Some("no-at-sign")), "no-at-sign");
        assert_eq!(display_name_for(None, Some("@example.com")), "@example.com");
    }

    #[test]
    fn display_name_sentinel() {
        assert_eq!(display_name_for(None, None), "Anonymous");
    }
}
