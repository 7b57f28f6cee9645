//! The nettest capability interface and per-run context.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{bytes::BytesInfo, settings::Settings};

/// Transport flavor of a discovered backend endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    #[default]
    None,
    Onion,
    Cloudfront,
    Https,
}

/// A discovered service location.
///
/// `front` is nonempty exactly when `kind` is cloudfront.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    #[serde(rename = "type")]
    pub kind: EndpointType,
    pub address: String,
    pub front: String,
}

/// Facts about the probe's environment, accumulated by the early pipeline
/// stages and read-only once measurement starts.
#[derive(Debug, Clone, Default)]
pub struct NettestContext {
    pub collectors: Vec<EndpointInfo>,
    pub probe_asn: String,
    pub probe_cc: String,
    pub probe_ip: String,
    pub probe_network_name: String,
    pub report_id: String,
    pub resolver_ip: String,
    pub test_helpers: BTreeMap<String, Vec<EndpointInfo>>,
}

/// The keys a nettest fills while measuring one input.
pub type TestKeys = Map<String, Value>;

/// A single measurement experiment.
///
/// The runner drives implementations through this interface: it asks for
/// identity and helper requirements up front, then invokes [`run`] once per
/// input from possibly-concurrent workers.
///
/// [`run`]: Nettest::run
#[async_trait]
pub trait Nettest: Send + Sync {
    fn name(&self) -> String {
        String::new()
    }

    fn version(&self) -> String {
        "0.0.1".to_string()
    }

    /// Names of the test helpers this nettest wants discovered.
    fn test_helpers(&self) -> Vec<String> {
        Vec::new()
    }

    fn needs_input(&self) -> bool {
        false
    }

    /// Measure one input, filling `test_keys` and accounting traffic in
    /// `bytes`.
    ///
    /// An error means the measurement itself failed; the runner reports it
    /// and still submits whatever `test_keys` contains.
    async fn run(
        &self,
        settings: &Settings,
        ctx: &NettestContext,
        input: &str,
        test_keys: &mut TestKeys,
        bytes: &BytesInfo,
    ) -> Result<()> {
        let _ = (settings, ctx, input, test_keys, bytes);
        // Pretend to measure for a while.
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(())
    }
}

/// Placeholder nettest exercising the whole pipeline without any real
/// measurement.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyNettest;

#[async_trait]
impl Nettest for DummyNettest {}
