//! Fuzzy string ratios in the 0-100 range.
//!
//! The vendor matcher and the duplicate trigger need the classic ratio family
//! (simple, partial, token-sort, token-set) on top of a normalized edit
//! distance. Inputs are compared case-insensitively by callers that need it.

use strsim::normalized_levenshtein;

/// Plain sequence ratio, 0-100.
pub fn simple_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 100.0;
    }
    normalized_levenshtein(a, b) * 100.0
}

/// Best alignment of the shorter string against same-length windows of the
/// longer one, 0-100.
pub fn partial_ratio(a: &str, b: &str) -> f64 {
    let (short, long) = if a.chars().count() <= b.chars().count() { (a, b) } else { (b, a) };
    let short_len = short.chars().count();
    if short_len == 0 {
        return if long.is_empty() { 100.0 } else { 0.0 };
    }
    let long_chars: Vec<char> = long.chars().collect();
    if long_chars.len() == short_len {
        return simple_ratio(short, long);
    }
    let mut best = 0.0f64;
    for start in 0..=(long_chars.len() - short_len) {
        let window: String = long_chars[start..start + short_len].iter().collect();
        let score = simple_ratio(short, &window);
        if score > best {
            best = score;
        }
        if best >= 100.0 {
            break;
        }
    }
    best
}

fn sorted_tokens(s: &str) -> Vec<&str> {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens
}

/// Ratio of the alphabetically sorted token strings, 0-100. Insensitive to
/// word order.
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    simple_ratio(&sorted_tokens(a).join(" "), &sorted_tokens(b).join(" "))
}

/// Ratio over token intersections and differences, 0-100. Insensitive to
/// word order and repetition.
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    use std::collections::BTreeSet;
    let set_a: BTreeSet<&str> = a.split_whitespace().collect();
    let set_b: BTreeSet<&str> = b.split_whitespace().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 100.0;
    }
    let common: Vec<&str> = set_a.intersection(&set_b).copied().collect();
    let diff_a: Vec<&str> = set_a.difference(&set_b).copied().collect();
    let diff_b: Vec<&str> = set_b.difference(&set_a).copied().collect();

    let common_str = common.join(" ");
    let combined_a = if diff_a.is_empty() {
        common_str.clone()
    } else if common_str.is_empty() {
        diff_a.join(" ")
    } else {
        format!("{} {}", common_str, diff_a.join(" "))
    };
    let combined_b = if diff_b.is_empty() {
        common_str.clone()
    } else if common_str.is_empty() {
        diff_b.join(" ")
    } else {
        format!("{} {}", common_str, diff_b.join(" "))
    };

    simple_ratio(&common_str, &combined_a)
        .max(simple_ratio(&common_str, &combined_b))
        .max(simple_ratio(&combined_a, &combined_b))
}

/// Normalized sequence similarity in [0,1], case-insensitive. Used by the
/// entity resolver.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    normalized_levenshtein(&a.to_lowercase(), &b.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_score_100() {
        assert!((simple_ratio("semen gresik", "semen gresik") - 100.0).abs() < 1e-9);
        assert!((token_sort_ratio("a b c", "c b a") - 100.0).abs() < 1e-9);
        assert!((token_set_ratio("a b b c", "c a b") - 100.0).abs() < 1e-9);
    }

    #[test]
    fn partial_ratio_finds_substring() {
        assert!((partial_ratio("SEMEN", "TRF PT SEMEN INDONESIA") - 100.0).abs() < 1e-9);
    }

    #[test]
    fn disjoint_strings_score_low() {
        assert!(simple_ratio("abcdef", "zzzzzz") < 20.0);
    }

    #[test]
    fn name_similarity_is_case_insensitive() {
        assert!(name_similarity("PT Semen Indonesia", "pt semen indonesia") > 0.999);
    }

    #[test]
    fn token_sort_handles_reordered_vendor_names() {
        let a = "indonesia semen pt";
        let b = "pt semen indonesia";
        assert!(token_sort_ratio(a, b) > 99.0);
        assert!(simple_ratio(a, b) < 80.0);
    }
}
