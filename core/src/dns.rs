/// Collapses a string into a valid (lowercase, `[a-z0-9-]`) DNS label,
/// trimming leading/trailing dashes and capping length at 50 characters.
/// Falls back to `"run"` when nothing usable remains.
pub fn sanitize_dns_label(s: &str) -> String {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return "run".to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut last_dash = false;
    for c in s.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let out = out.trim_matches('-');
    if out.is_empty() {
        return "run".to_string();
    }
    let mut out = out.to_string();
    if out.len() > 50 {
        out.truncate(50);
        out = out.trim_matches('-').to_string();
    }
    if out.is_empty() { "run".to_string() } else { out }
}

/// Returns the last `n` characters of `name`, or the whole string if it's
/// shorter than `n`.
pub fn suffix(name: &str, n: usize) -> String {
    if name.len() <= n {
        name.to_string()
    } else {
        name[name.len() - n..].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_falls_back_to_run() {
        assert_eq!(sanitize_dns_label(""), "run");
        assert_eq!(sanitize_dns_label("   "), "run");
        assert_eq!(sanitize_dns_label("!!!"), "run");
    }

    #[test]
    fn collapses_runs_of_invalid_characters_to_single_dash() {
        assert_eq!(sanitize_dns_label("Hello World!!"), "hello-world");
        assert_eq!(sanitize_dns_label("a__b--c"), "a-b-c");
    }

    #[test]
    fn trims_leading_and_trailing_dashes() {
        assert_eq!(sanitize_dns_label("--foo--"), "foo");
    }

    #[test]
    fn truncates_to_fifty_characters() {
        let long = "a".repeat(80);
        let out = sanitize_dns_label(&long);
        assert_eq!(out.len(), 50);
    }

    #[test]
    fn suffix_returns_whole_string_when_shorter_than_n() {
        assert_eq!(suffix("abc", 5), "abc");
        assert_eq!(suffix("abcdef", 3), "def");
    }
}
