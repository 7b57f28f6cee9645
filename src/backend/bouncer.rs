//! Discovery of collectors and test helpers via the bouncer.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::debug;

use super::trim_trailing_slashes;
use crate::{
    error::ErrContext,
    http::{HttpClient, REQUEST_TIMEOUT},
    nettest::{EndpointInfo, EndpointType},
};

/// Discovered test helpers, keyed by the name a nettest knows them under.
pub type HelperMap = BTreeMap<String, Vec<EndpointInfo>>;

/// Client for the bouncer discovery service.
#[derive(Clone)]
pub struct BouncerClient {
    http: HttpClient,
}

impl BouncerClient {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    /// Ask the bouncer which collectors and test helpers serve the named
    /// nettest.
    pub async fn query(
        &self,
        base_url: &str,
        name: &str,
        helper_names: &[String],
        version: &str,
    ) -> Result<(Vec<EndpointInfo>, HelperMap), ErrContext> {
        let request = json!({
            "net-tests": [{
                "input-hashes": null,
                "name": name,
                "test-helpers": helper_names,
                "version": version,
            }]
        });
        let body =
            serde_json::to_string(&request).map_err(|e| ErrContext::json(e.to_string()))?;
        let url = format!("{}/bouncer/net-tests", trim_trailing_slashes(base_url));
        debug!("query_bouncer: JSON request: {body}");
        let response = self.http.post_json(&url, &body, REQUEST_TIMEOUT).await?;
        debug!("query_bouncer: JSON reply: {response}");
        parse_response(&response)
    }
}

/// Parse the bouncer reply into collectors and a helper map.
///
/// The primary `collector` entry is an onion endpoint; alternates carry an
/// explicit type and are kept only when https or cloudfront. The same rule
/// applies per object under `test-helpers-alternate`.
pub(crate) fn parse_response(body: &str) -> Result<(Vec<EndpointInfo>, HelperMap), ErrContext> {
    let doc: Value = serde_json::from_str(body).map_err(|e| ErrContext::json(e.to_string()))?;
    let mut collectors = Vec::new();
    let mut helpers = HelperMap::new();
    let entries = doc
        .get("net-tests")
        .and_then(Value::as_array)
        .ok_or_else(|| shape_err("net-tests"))?;
    for entry in entries {
        let address = entry
            .get("collector")
            .and_then(Value::as_str)
            .ok_or_else(|| shape_err("collector"))?;
        collectors.push(onion_endpoint(address));
        let alternates = entry
            .get("collector-alternate")
            .and_then(Value::as_array)
            .ok_or_else(|| shape_err("collector-alternate"))?;
        for alternate in alternates {
            if let Some(endpoint) = parse_alternate(alternate)? {
                collectors.push(endpoint);
            }
        }
        let plain = entry
            .get("test-helpers")
            .and_then(Value::as_object)
            .ok_or_else(|| shape_err("test-helpers"))?;
        for (key, value) in plain {
            let address = value.as_str().ok_or_else(|| shape_err("test-helpers"))?;
            helpers
                .entry(key.clone())
                .or_default()
                .push(onion_endpoint(address));
        }
        let alternate = entry
            .get("test-helpers-alternate")
            .and_then(Value::as_object)
            .ok_or_else(|| shape_err("test-helpers-alternate"))?;
        for (key, values) in alternate {
            let values = values
                .as_array()
                .ok_or_else(|| shape_err("test-helpers-alternate"))?;
            for value in values {
                if let Some(endpoint) = parse_alternate(value)? {
                    helpers.entry(key.clone()).or_default().push(endpoint);
                }
            }
        }
    }
    Ok((collectors, helpers))
}

fn onion_endpoint(address: &str) -> EndpointInfo {
    EndpointInfo {
        kind: EndpointType::Onion,
        address: address.to_string(),
        front: String::new(),
    }
}

fn parse_alternate(value: &Value) -> Result<Option<EndpointInfo>, ErrContext> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| shape_err("type"))?;
    let endpoint = match kind {
        "https" => EndpointInfo {
            kind: EndpointType::Https,
            address: required_string(value, "address")?,
            front: String::new(),
        },
        "cloudfront" => EndpointInfo {
            kind: EndpointType::Cloudfront,
            address: required_string(value, "address")?,
            front: required_string(value, "front")?,
        },
        // Unknown transports are skipped, not an error.
        _ => return Ok(None),
    };
    Ok(Some(endpoint))
}

fn required_string(value: &Value, field: &str) -> Result<String, ErrContext> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| shape_err(field))
}

fn shape_err(field: &str) -> ErrContext {
    ErrContext::json(format!("unexpected shape for '{field}'"))
}
