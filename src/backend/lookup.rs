//! Probe IP and resolver IP discovery.

use tokio::net::lookup_host;

use crate::{
    bytes::BytesInfo,
    error::ErrContext,
    http::{HttpClient, REQUEST_TIMEOUT},
};

const GEOIP_LOOKUP_URL: &str = "https://geoip.ubuntu.com/lookup";

const RESOLVER_PROBE_HOST: &str = "whoami.akamai.net";

/// Upper bound for one UDP DNS datagram, per direction.
const DNS_DATAGRAM_ESTIMATE: u64 = 512;

/// Discover the probe's public IP address.
///
/// The reply embeds the address between `<Ip>` tags. When extraction fails
/// the result is an empty string, not an error; the address is not
/// syntax-checked at this layer.
pub async fn lookup_ip(http: &HttpClient) -> Result<String, ErrContext> {
    let body = http.get(GEOIP_LOOKUP_URL, REQUEST_TIMEOUT).await?;
    Ok(extract_tag(&body, "<Ip>", "</Ip>").unwrap_or_default())
}

/// The text between `open` and `close`, lowercased and with all whitespace
/// removed.
pub(crate) fn extract_tag(body: &str, open: &str, close: &str) -> Option<String> {
    let start = body.find(open)? + open.len();
    let end = body[start..].find(close)? + start;
    Some(
        body[start..end]
            .chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect(),
    )
}

/// Discover the address of the system resolver by asking it to resolve a
/// hostname whose A record encodes the asker.
///
/// Both byte counters are credited one full datagram as an upper bound for
/// the exchange.
pub async fn lookup_resolver_ip(bytes: &BytesInfo) -> Result<String, ErrContext> {
    bytes.add_up(DNS_DATAGRAM_ESTIMATE);
    bytes.add_down(DNS_DATAGRAM_ESTIMATE);
    let addresses = lookup_host((RESOLVER_PROBE_HOST, 443))
        .await
        .map_err(|e| ErrContext::library("tokio/lookup_host", "", e.to_string()))?;
    addresses
        .filter(|address| address.is_ipv4())
        .map(|address| address.ip().to_string())
        .next()
        .ok_or_else(|| {
            ErrContext::library(
                "tokio/lookup_host",
                "",
                format!("no IPv4 address for {RESOLVER_PROBE_HOST}"),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_content_is_extracted() {
        let body = "<Response><Ip>93.147.1.1</Ip></Response>";
        assert_eq!(
            extract_tag(body, "<Ip>", "</Ip>"),
            Some("93.147.1.1".to_string())
        );
    }

    #[test]
    fn whitespace_is_stripped_and_case_lowered() {
        let body = "<Ip>\n  2001:DB8::1\n</Ip>";
        assert_eq!(
            extract_tag(body, "<Ip>", "</Ip>"),
            Some("2001:db8::1".to_string())
        );
    }

    #[test]
    fn missing_tags_yield_none() {
        assert_eq!(extract_tag("<Response/>", "<Ip>", "</Ip>"), None);
        assert_eq!(extract_tag("<Ip>unterminated", "<Ip>", "</Ip>"), None);
    }

    #[tokio::test]
    async fn resolver_lookup_credits_both_counters() {
        let bytes = BytesInfo::new();
        // The resolution itself may fail in a sandboxed environment; the
        // estimate is credited regardless.
        let _ = lookup_resolver_ip(&bytes).await;
        assert_eq!(bytes.up(), DNS_DATAGRAM_ESTIMATE);
        assert_eq!(bytes.down(), DNS_DATAGRAM_ESTIMATE);
    }
}
