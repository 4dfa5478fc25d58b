//! URL helpers used by the dispatch path.
//!
//! Only what the orchestrator needs lives here: protocol normalisation for
//! caller supplied strings and public-suffix aware domain extraction used by
//! the rate limiter and the manifest.

use url::{Host, Url};

/// Prefixes `http://` when the caller left the scheme out.
pub fn add_missing_protocol(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Parses a caller supplied URL, adding a missing scheme first.
pub fn parse_url(raw: &str) -> Result<Url, url::ParseError> {
    Url::parse(&add_missing_protocol(raw))
}

/// Returns the registered domain (eTLD+1) of the URL's host.
///
/// IP addresses and hosts the public suffix list cannot split (e.g.
/// `localhost`) are returned as-is so that they still compare equal to
/// themselves.
pub fn registered_domain(url: &Url) -> Option<String> {
    match url.host()? {
        Host::Ipv4(addr) => Some(addr.to_string()),
        Host::Ipv6(addr) => Some(addr.to_string()),
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            match psl::domain_str(&domain) {
                Some(registered) => Some(registered.to_string()),
                None => Some(domain),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_protocol_when_missing() {
        assert_eq!(add_missing_protocol("example.com/a"), "http://example.com/a");
        assert_eq!(add_missing_protocol("https://example.com"), "https://example.com");
    }

    #[test]
    fn registered_domain_strips_subdomains() {
        let url = Url::parse("https://a.b.example.com/path").unwrap();
        assert_eq!(registered_domain(&url).as_deref(), Some("example.com"));
    }

    #[test]
    fn registered_domain_handles_multi_part_suffix() {
        let url = Url::parse("https://www.example.co.uk").unwrap();
        assert_eq!(registered_domain(&url).as_deref(), Some("example.co.uk"));
    }

    #[test]
    fn ip_hosts_map_to_themselves() {
        let url = Url::parse("http://127.0.0.1:8080/").unwrap();
        assert_eq!(registered_domain(&url).as_deref(), Some("127.0.0.1"));
    }
}
