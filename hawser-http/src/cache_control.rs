//! Cache-Control header parsing.

use crate::headers::Headers;

/// Cache directives from a request or response, per RFC 7234 Section 5.2.
///
/// `s-maxage` is deliberately not parsed: this is a private cache and must
/// ignore shared-cache lifetimes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub no_cache: bool,
    pub no_store: bool,
    pub max_age_seconds: Option<u64>,
    pub public: bool,
    pub private: bool,
    pub must_revalidate: bool,
    /// `max-stale` with no argument means any staleness is acceptable and
    /// parses as `u64::MAX`.
    pub max_stale_seconds: Option<u64>,
    pub min_fresh_seconds: Option<u64>,
    pub only_if_cached: bool,
}

impl CacheControl {
    /// Parse the directives of every `Cache-Control` header, plus the
    /// legacy `Pragma: no-cache`.
    pub fn parse(headers: &Headers) -> CacheControl {
        let mut result = CacheControl::default();
        for (name, value) in headers.iter() {
            if name.eq_ignore_ascii_case("Cache-Control")
                || name.eq_ignore_ascii_case("Pragma")
            {
                parse_directives(value, &mut result);
            }
        }
        result
    }
}

fn parse_directives(value: &str, out: &mut CacheControl) {
    let mut rest = value;
    while !rest.is_empty() {
        let (directive, argument, remainder) = next_directive(rest);
        rest = remainder;
        if directive.is_empty() {
            continue;
        }
        let seconds = || argument.and_then(|a| a.trim().parse::<u64>().ok());
        match directive.to_ascii_lowercase().as_str() {
            "no-cache" => out.no_cache = true,
            "no-store" => out.no_store = true,
            "max-age" => out.max_age_seconds = seconds(),
            "public" => out.public = true,
            "private" => out.private = true,
            "must-revalidate" => out.must_revalidate = true,
            "max-stale" => out.max_stale_seconds = Some(seconds().unwrap_or(u64::MAX)),
            "min-fresh" => out.min_fresh_seconds = seconds(),
            "only-if-cached" => out.only_if_cached = true,
            _ => {}
        }
    }
}

/// Split off one `directive[=argument]` from a comma-separated list,
/// honoring quoted-string arguments.
fn next_directive(input: &str) -> (&str, Option<&str>, &str) {
    let input = input.trim_start_matches([' ', '\t', ',']);
    let end = input
        .find(|c| c == '=' || c == ',')
        .unwrap_or(input.len());
    let directive = input[..end].trim();

    if !input[end..].starts_with('=') {
        let rest = input.get(end + 1..).unwrap_or("");
        return (directive, None, rest);
    }

    let after_eq = &input[end + 1..];
    if let Some(quoted) = after_eq.strip_prefix('"') {
        match quoted.find('"') {
            Some(close) => {
                let argument = &quoted[..close];
                (directive, Some(argument), quoted.get(close + 1..).unwrap_or(""))
            }
            None => (directive, Some(quoted), ""),
        }
    } else {
        let arg_end = after_eq.find(',').unwrap_or(after_eq.len());
        let argument = after_eq[..arg_end].trim();
        let rest = after_eq.get(arg_end + 1..).unwrap_or("");
        (directive, Some(argument), rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: &str) -> CacheControl {
        CacheControl::parse(&Headers::of(&[("Cache-Control", value)]).unwrap())
    }

    #[test]
    fn parses_boolean_directives() {
        let cc = parse("no-cache, no-store, public, private, must-revalidate, only-if-cached");
        assert!(cc.no_cache);
        assert!(cc.no_store);
        assert!(cc.public);
        assert!(cc.private);
        assert!(cc.must_revalidate);
        assert!(cc.only_if_cached);
    }

    #[test]
    fn parses_second_arguments() {
        let cc = parse("max-age=60, min-fresh=5, max-stale=30");
        assert_eq!(cc.max_age_seconds, Some(60));
        assert_eq!(cc.min_fresh_seconds, Some(5));
        assert_eq!(cc.max_stale_seconds, Some(30));
    }

    #[test]
    fn valueless_max_stale_accepts_any_staleness() {
        let cc = parse("max-stale");
        assert_eq!(cc.max_stale_seconds, Some(u64::MAX));
    }

    #[test]
    fn quoted_arguments_are_unwrapped() {
        let cc = parse("max-age=\"120\"");
        assert_eq!(cc.max_age_seconds, Some(120));
    }

    #[test]
    fn unknown_directives_are_ignored() {
        let cc = parse("immutable, stale-while-revalidate=60, max-age=1");
        assert_eq!(cc.max_age_seconds, Some(1));
        assert!(!cc.no_cache);
    }

    #[test]
    fn directives_accumulate_across_headers() {
        let headers = Headers::of(&[
            ("Cache-Control", "max-age=10"),
            ("Cache-Control", "no-store"),
        ])
        .unwrap();
        let cc = CacheControl::parse(&headers);
        assert_eq!(cc.max_age_seconds, Some(10));
        assert!(cc.no_store);
    }

    #[test]
    fn pragma_no_cache_is_honored() {
        let headers = Headers::of(&[("Pragma", "no-cache")]).unwrap();
        assert!(CacheControl::parse(&headers).no_cache);
    }

    #[test]
    fn case_insensitive_directive_names() {
        let cc = parse("No-Cache, MAX-AGE=3");
        assert!(cc.no_cache);
        assert_eq!(cc.max_age_seconds, Some(3));
    }
}
