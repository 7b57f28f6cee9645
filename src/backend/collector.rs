//! Report lifecycle against a collector.

use serde_json::{json, Value};
use tracing::debug;

use super::trim_trailing_slashes;
use crate::{
    error::ErrContext,
    http::{HttpClient, REQUEST_TIMEOUT},
    nettest::NettestContext,
    settings::Settings,
};

/// Client for the collector report API.
#[derive(Clone)]
pub struct CollectorClient {
    http: HttpClient,
}

impl CollectorClient {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    /// Open a report, returning the collector-assigned report id.
    pub async fn open_report(
        &self,
        base_url: &str,
        test_start_time: &str,
        settings: &Settings,
        ctx: &NettestContext,
        test_name: &str,
        test_version: &str,
    ) -> Result<String, ErrContext> {
        let request = open_report_request(settings, ctx, test_start_time, test_name, test_version);
        let body = serde_json::to_string(&request).map_err(|e| ErrContext::json(e.to_string()))?;
        let url = format!("{}/report", trim_trailing_slashes(base_url));
        debug!("open_report: URL: {url}");
        debug!("open_report: JSON request: {body}");
        let response = self.http.post_json(&url, &body, REQUEST_TIMEOUT).await?;
        debug!("open_report: JSON reply: {response}");
        let doc: Value =
            serde_json::from_str(&response).map_err(|e| ErrContext::json(e.to_string()))?;
        match doc.get("report_id").and_then(Value::as_str) {
            Some(report_id) => Ok(report_id.to_string()),
            None => Err(ErrContext::json("missing 'report_id' in reply")),
        }
    }

    /// Append a serialized measurement to an open report.
    pub async fn update_report(
        &self,
        base_url: &str,
        report_id: &str,
        measurement_json: &str,
    ) -> Result<(), ErrContext> {
        let request = json!({ "content": measurement_json, "format": "json" });
        let body = serde_json::to_string(&request).map_err(|e| ErrContext::json(e.to_string()))?;
        let url = format!("{}/report/{report_id}", trim_trailing_slashes(base_url));
        debug!("update_report: URL: {url}");
        self.http.post_json(&url, &body, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    /// Close an open report. The request body is empty.
    pub async fn close_report(&self, base_url: &str, report_id: &str) -> Result<(), ErrContext> {
        let url = format!("{}/report/{report_id}/close", trim_trailing_slashes(base_url));
        debug!("close_report: URL: {url}");
        self.http.post_json(&url, "", REQUEST_TIMEOUT).await?;
        Ok(())
    }
}

pub(crate) fn open_report_request(
    settings: &Settings,
    ctx: &NettestContext,
    test_start_time: &str,
    test_name: &str,
    test_version: &str,
) -> Value {
    json!({
        "data_format_version": "0.2.0",
        "format": "json",
        "input_hashes": [],
        "probe_asn": ctx.probe_asn,
        "probe_cc": ctx.probe_cc,
        "software_name": settings.software_name,
        "software_version": settings.software_version,
        "test_name": test_name,
        "test_start_time": test_start_time,
        "test_version": test_version,
    })
}
