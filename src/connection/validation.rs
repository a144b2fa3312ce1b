//! APN and proxy validation.

use super::types::MAX_APN_LENGTH;

/// Check an access point name against the standard character class:
/// alphanumerics, hyphens and single dot separators, not starting with
/// a dot. The empty string is rejected; callers that allow
/// freshly-created stubs check for emptiness themselves.
pub fn is_valid_apn(apn: &str) -> bool {
    if apn.is_empty() || apn.len() > MAX_APN_LENGTH {
        return false;
    }

    let mut last_was_dot = true;

    for c in apn.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' => last_was_dot = false,
            '.' if !last_was_dot => last_was_dot = true,
            _ => return false,
        }
    }

    true
}

/// MMS proxy address parsed from its `[scheme://]host[:port][/path]`
/// string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAddress {
    /// Host part, without scheme, port or path.
    pub host: String,
    /// Explicit port, or the scheme default (http 80, https 443).
    pub port: u16,
}

impl ProxyAddress {
    /// Parse a proxy string. Unknown schemes are rejected; an absent
    /// scheme defaults to http.
    pub fn parse(proxy: &str) -> Option<Self> {
        let (rest, mut port) = match proxy.split_once("://") {
            Some((scheme, rest)) => {
                let default = if scheme.eq_ignore_ascii_case("https") {
                    443
                } else if scheme.eq_ignore_ascii_case("http") {
                    80
                } else {
                    return None;
                };
                (rest, default)
            }
            None => (proxy, 80),
        };

        let host_port = rest.split('/').next().unwrap_or(rest);

        let host = match host_port.rsplit_once(':') {
            Some((host, port_str)) => match port_str.parse::<u16>() {
                Ok(explicit) => {
                    port = explicit;
                    host
                }
                // Not a port suffix after all, keep the whole thing.
                Err(_) => host_port,
            },
            None => host_port,
        };

        if host.is_empty() {
            return None;
        }

        Some(Self {
            host: host.to_string(),
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn accepts_plain_apn() {
        assert!(is_valid_apn("internet"));
        assert!(is_valid_apn("web.provider.com"));
        assert!(is_valid_apn("a1-b2.c3"));

        // Ragged but tolerated label edges.
        assert!(is_valid_apn("-internet"));
        assert!(is_valid_apn("internet-"));
        assert!(is_valid_apn("internet."));
    }

    #[test]
    fn rejects_malformed_apn() {
        assert!(!is_valid_apn(""));
        assert!(!is_valid_apn(".internet"));
        assert!(!is_valid_apn("inter net"));
        assert!(!is_valid_apn("web..provider"));
        assert!(!is_valid_apn(&"a".repeat(MAX_APN_LENGTH + 1)));
    }

    #[test]
    fn apn_validation_is_idempotent() {
        for apn in ["internet", "web.provider.com", "bad..apn"] {
            let first = is_valid_apn(apn);
            assert_eq!(is_valid_apn(apn), first);
        }
    }

    #[test]
    fn parses_full_proxy() {
        let proxy = ProxyAddress::parse("http://mmsc.op.com:8080/x").unwrap();
        assert_eq!(proxy.host, "mmsc.op.com");
        assert_eq!(proxy.port, 8080);
    }

    #[test]
    fn parses_bare_host() {
        let proxy = ProxyAddress::parse("10.0.0.1").unwrap();
        assert_eq!(proxy.host, "10.0.0.1");
        assert_eq!(proxy.port, 80);
    }

    #[test]
    fn scheme_defaults() {
        assert_eq!(ProxyAddress::parse("https://mmsc.op.com").unwrap().port, 443);
        assert_eq!(ProxyAddress::parse("http://mmsc.op.com").unwrap().port, 80);
        assert!(ProxyAddress::parse("ftp://mmsc.op.com").is_none());
    }

    #[test]
    fn ignores_path_and_bad_port() {
        let proxy = ProxyAddress::parse("mmsc.op.com/path/x").unwrap();
        assert_eq!(proxy.host, "mmsc.op.com");

        // A colon without a numeric suffix is part of the host.
        let proxy = ProxyAddress::parse("mmsc.op.com:http").unwrap();
        assert_eq!(proxy.host, "mmsc.op.com:http");
        assert_eq!(proxy.port, 80);
    }
}
