use std::error::Error;

use murmur_protocol::ErrorCategory;

/// Flattens an error and its `source()` chain into one lowercase line.
///
/// Transport errors usually bury the useful part ("connection refused",
/// "status 429") a few levels down.
pub fn error_chain_text(error: &(dyn Error + 'static)) -> String {
    let mut parts = vec![error.to_string()];
    let mut current = error.source();
    while let Some(source) = current {
        parts.push(source.to_string());
        current = source.source();
    }
    parts.join(": ").to_lowercase()
}

const AUTHENTICATION_MARKERS: &[&str] = &[
    "invalid api key",
    "incorrect api key",
    "invalid_api_key",
    "unauthorized",
    "authentication",
];
const QUOTA_MARKERS: &[&str] = &[
    "insufficient_quota",
    "insufficient balance",
    "exceeded your current quota",
    "quota",
    "billing",
    "payment required",
];
const FORBIDDEN_MARKERS: &[&str] = &["forbidden", "permission denied", "access denied"];
const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "rate_limit", "too many requests"];
const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout", "deadline exceeded"];
const UNREACHABLE_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "failed to lookup address",
    "dns error",
    "name or service not known",
    "no route to host",
    "network is unreachable",
    "error sending request",
    "connect error",
];
const UPSTREAM_MARKERS: &[&str] = &[
    "internal server error",
    "bad gateway",
    "service unavailable",
    "overloaded",
];

/// Classifies free-form backend error text.
///
/// Keyword markers are checked before bare status codes because providers
/// reuse statuses (quota exhaustion arrives as 429 from OpenAI).
pub fn classify_detail(detail: &str) -> ErrorCategory {
    let detail = detail.to_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|marker| detail.contains(marker));

    let ordered = [
        (QUOTA_MARKERS, ErrorCategory::QuotaExceeded),
        (AUTHENTICATION_MARKERS, ErrorCategory::Authentication),
        (FORBIDDEN_MARKERS, ErrorCategory::Forbidden),
        (RATE_LIMIT_MARKERS, ErrorCategory::RateLimited),
        (TIMEOUT_MARKERS, ErrorCategory::Timeout),
        (UPSTREAM_MARKERS, ErrorCategory::UpstreamInternal),
        (UNREACHABLE_MARKERS, ErrorCategory::Unreachable),
    ];
    if let Some((_, category)) = ordered.iter().find(|(markers, _)| contains_any(*markers)) {
        return *category;
    }

    status_codes(&detail)
        .find_map(ErrorCategory::from_status)
        .unwrap_or(ErrorCategory::Unknown)
}

/// Standalone three-digit numbers in the 4xx/5xx range.
fn status_codes(detail: &str) -> impl Iterator<Item = u16> + '_ {
    detail
        .split(|character: char| !character.is_ascii_digit())
        .filter(|token| token.len() == 3)
        .filter_map(|token| token.parse::<u16>().ok())
        .filter(|status| (400..600).contains(status))
}

#[cfg(test)]
mod tests {
    use std::fmt;

    use super::*;

    #[test]
    fn openai_quota_429_is_quota_not_rate_limit() {
        let detail = "ProviderError: 429 You exceeded your current quota, please check your plan";
        assert_eq!(classify_detail(detail), ErrorCategory::QuotaExceeded);
    }

    #[test]
    fn bare_status_codes_are_mapped() {
        assert_eq!(
            classify_detail("invalid status code 401"),
            ErrorCategory::Authentication
        );
        assert_eq!(classify_detail("status: 403"), ErrorCategory::Forbidden);
        assert_eq!(classify_detail("HTTP 429"), ErrorCategory::RateLimited);
        assert_eq!(classify_detail("got 503 from upstream"), ErrorCategory::UpstreamInternal);
    }

    #[test]
    fn network_failures_are_unreachable() {
        assert_eq!(
            classify_detail("error sending request for url: tcp connect error: Connection refused"),
            ErrorCategory::Unreachable
        );
        assert_eq!(
            classify_detail("dns error: failed to lookup address information"),
            ErrorCategory::Unreachable
        );
    }

    #[test]
    fn timeouts_win_over_generic_send_errors() {
        assert_eq!(
            classify_detail("error sending request: operation timed out"),
            ErrorCategory::Timeout
        );
    }

    #[test]
    fn model_names_are_not_mistaken_for_status_codes() {
        assert_eq!(
            classify_detail("unexpected token in gpt-4o-mini response"),
            ErrorCategory::Unknown
        );
    }

    #[derive(Debug)]
    struct Layer {
        message: &'static str,
        inner: Option<Box<Layer>>,
    }

    impl fmt::Display for Layer {
        fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str(self.message)
        }
    }

    impl Error for Layer {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            self.inner.as_deref().map(|inner| inner as &(dyn Error + 'static))
        }
    }

    #[test]
    fn chain_text_includes_nested_sources() {
        let error = Layer {
            message: "Request failed",
            inner: Some(Box::new(Layer {
                message: "Connection Refused",
                inner: None,
            })),
        };
        let text = error_chain_text(&error);
        assert_eq!(text, "request failed: connection refused");
        assert_eq!(classify_detail(&text), ErrorCategory::Unreachable);
    }
}
