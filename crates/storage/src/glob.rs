//! Redis-style glob matching
//!
//! Same rules as the server's `MATCH` option, used by the in-memory backend
//! for `KEYS`, `SCAN` and `ZSCAN`:
//!
//! * `*` any sequence, including empty
//! * `?` exactly one byte
//! * `[abc]`, `[a-z]`, `[^...]` byte classes
//! * `\x` the literal `x`
//!
//! Matching is case-sensitive.

/// Whether `text` matches `pattern`
pub fn glob_match(pattern: &str, text: &str) -> bool {
    match_bytes(pattern.as_bytes(), text.as_bytes())
}

fn match_bytes(pattern: &[u8], text: &[u8]) -> bool {
    let mut p = 0;
    let mut t = 0;

    while p < pattern.len() {
        match pattern[p] {
            b'*' => {
                while p + 1 < pattern.len() && pattern[p + 1] == b'*' {
                    p += 1;
                }
                p += 1;
                if p == pattern.len() {
                    return true;
                }
                return (t..=text.len()).any(|start| match_bytes(&pattern[p..], &text[start..]));
            }
            b'?' => {
                if t == text.len() {
                    return false;
                }
                p += 1;
                t += 1;
            }
            b'[' => {
                if t == text.len() {
                    return false;
                }
                let (matched, next) = match_class(pattern, p + 1, text[t]);
                if !matched {
                    return false;
                }
                p = next;
                t += 1;
            }
            b'\\' if p + 1 < pattern.len() => {
                if t == text.len() || pattern[p + 1] != text[t] {
                    return false;
                }
                p += 2;
                t += 1;
            }
            literal => {
                if t == text.len() || literal != text[t] {
                    return false;
                }
                p += 1;
                t += 1;
            }
        }
    }
    t == text.len()
}

/// Match one byte against the class starting at `start` (just past `[`).
/// Returns whether it matched and the pattern index after the closing `]`.
fn match_class(pattern: &[u8], start: usize, byte: u8) -> (bool, usize) {
    let mut p = start;
    let negate = p < pattern.len() && pattern[p] == b'^';
    if negate {
        p += 1;
    }

    let mut matched = false;
    while p < pattern.len() && pattern[p] != b']' {
        if pattern[p] == b'\\' && p + 1 < pattern.len() {
            matched |= pattern[p + 1] == byte;
            p += 2;
        } else if p + 2 < pattern.len() && pattern[p + 1] == b'-' && pattern[p + 2] != b']' {
            let (lo, hi) = if pattern[p] <= pattern[p + 2] {
                (pattern[p], pattern[p + 2])
            } else {
                (pattern[p + 2], pattern[p])
            };
            matched |= lo <= byte && byte <= hi;
            p += 3;
        } else {
            matched |= pattern[p] == byte;
            p += 1;
        }
    }
    if p < pattern.len() {
        p += 1;
    }
    (matched != negate, p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn star_and_question() {
        assert!(glob_match("*", ""));
        assert!(glob_match("Systems:*", "Systems:abc"));
        assert!(glob_match("h?llo", "hello"));
        assert!(!glob_match("h?llo", "hllo"));
        assert!(glob_match("*::abc-123", "intel::abc-123"));
        assert!(!glob_match("*::abc-123", "intel::abc-1234"));
    }

    #[test]
    fn classes() {
        assert!(glob_match("h[ae]llo", "hallo"));
        assert!(!glob_match("h[ae]llo", "hillo"));
        assert!(glob_match("h[^e]llo", "hallo"));
        assert!(!glob_match("h[^e]llo", "hello"));
        assert!(glob_match("h[a-b]llo", "hbllo"));
        assert!(glob_match("10.0.0.1[^0-9]*", "10.0.0.1||loc||[a]"));
        assert!(!glob_match("10.0.0.1[^0-9]*", "10.0.0.12||loc||[a]"));
    }

    #[test]
    fn escapes() {
        assert!(glob_match(r"*\[a b\]*", "x||[a b]::id"));
        assert!(!glob_match(r"\*", "a"));
        assert!(glob_match(r"\*", "*"));
    }

    #[test]
    fn case_sensitive() {
        assert!(!glob_match("Intel*", "intel::1"));
    }

    proptest! {
        #[test]
        fn literal_pattern_matches_itself(s in "[a-zA-Z0-9:]{0,24}") {
            prop_assert!(glob_match(&s, &s));
        }

        #[test]
        fn prefix_star_matches_any_extension(prefix in "[a-z:]{0,8}", rest in "[a-z0-9:]{0,16}") {
            let text = format!("{}{}", prefix, rest);
            let prefix_pattern = format!("{}*", prefix);
            let suffix_pattern = format!("*{}", rest);
            prop_assert!(glob_match(&prefix_pattern, &text));
            prop_assert!(glob_match(&suffix_pattern, &text));
        }
    }
}
