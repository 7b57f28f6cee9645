//! The staged pipeline driving a nettest from queued to ended.

mod dispatch;
mod measurement;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use portable_atomic::{AtomicBool, Ordering};
use rand::seq::SliceRandom;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    backend::{lookup, BouncerClient, CollectorClient},
    bytes::BytesInfo,
    error::library_failure,
    events::{Emitter, EventSink, LogLevel},
    geoip,
    http::HttpClient,
    nettest::{EndpointType, Nettest, NettestContext},
    settings::Settings,
};

/// Serializes runs process-wide; only one runner makes progress at a time.
static RUN_GATE: Mutex<()> = Mutex::const_new(());

const DEFAULT_PROBE_IP: &str = "127.0.0.1";
const DEFAULT_PROBE_ASN: &str = "AS0";
const DEFAULT_PROBE_CC: &str = "ZZ";

/// UTC wall clock formatted the way the collector expects, with seconds
/// truncation and no fractional part.
pub(crate) fn format_utc_now() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Compile-time platform tag recorded in annotations.
pub(crate) const fn platform_name() -> &'static str {
    if cfg!(target_os = "android") {
        "android"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "ios") {
        "ios"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else {
        "unknown"
    }
}

/// Everything a measurement worker needs, shared read-only across tasks.
pub(crate) struct RunState {
    pub(crate) settings: Settings,
    pub(crate) nettest: Arc<dyn Nettest>,
    pub(crate) emitter: Emitter,
    pub(crate) collector: CollectorClient,
    pub(crate) bytes: Arc<BytesInfo>,
    pub(crate) ctx: NettestContext,
    pub(crate) collector_base_url: String,
    pub(crate) test_start_time: String,
    pub(crate) begin: Instant,
    pub(crate) interrupted: Arc<AtomicBool>,
}

impl RunState {
    pub(crate) fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

/// Drives one nettest through discovery, geolocation, measurement, and
/// report submission, narrating every step on the event stream.
pub struct Runner {
    settings: Settings,
    nettest: Arc<dyn Nettest>,
    emitter: Emitter,
    interrupted: Arc<AtomicBool>,
}

impl Runner {
    pub fn new(settings: Settings, nettest: Arc<dyn Nettest>, sink: Box<dyn EventSink>) -> Self {
        let emitter = Emitter::new(sink, settings.log_level);
        Self {
            settings,
            nettest,
            emitter,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ask the run to stop between inputs. An in-flight measurement is not
    /// preempted; workers observe the flag when they claim the next input.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn log_level(&self) -> LogLevel {
        self.emitter.log_level()
    }

    /// Execute the full pipeline.
    ///
    /// Stage failures are surfaced as `failure.*` events and never stop the
    /// pipeline; accordingly the return value is always `true`.
    pub async fn run(&self) -> bool {
        let bytes = Arc::new(BytesInfo::new());
        self.emitter.emit("status.queued", json!({}));
        // Only one run may be active per process at any given time. Note
        // that FIFO ordering of queued runs is not guaranteed.
        let _gate = RUN_GATE.lock().await;
        self.emitter.emit("status.started", json!({}));

        let http = HttpClient::new(self.emitter.clone(), bytes.clone(), &self.settings.ca_bundle_path);
        let bouncer = BouncerClient::new(http.clone());
        let collector = CollectorClient::new(http.clone());
        let mut ctx = NettestContext::default();

        if !self.settings.no_bouncer {
            match bouncer
                .query(
                    &self.settings.bouncer_base_url,
                    &self.nettest.name(),
                    &self.nettest.test_helpers(),
                    &self.nettest.version(),
                )
                .await
            {
                Ok((collectors, helpers)) => {
                    ctx.collectors = collectors;
                    ctx.test_helpers = helpers;
                }
                // Discovery is advisory: without it the run continues with
                // empty collector and helper lists.
                Err(err) => self
                    .emitter
                    .warn(format!("run: query_bouncer() failed: {err}")),
            }
        }
        self.progress(0.1, "contact bouncer");

        // The no_*_lookup settings control whether a lookup happens; the
        // save_real_* settings control, orthogonally, whether its result
        // ends up in the report.
        if self.settings.probe_ip.is_empty() {
            ctx.probe_ip = DEFAULT_PROBE_IP.to_string();
            if !self.settings.no_ip_lookup {
                match lookup::lookup_ip(&http).await {
                    Ok(ip) => {
                        ctx.probe_ip = ip;
                        self.emitter
                            .info(format!("Your public IP address: {}", ctx.probe_ip));
                    }
                    Err(err) => {
                        self.emitter.warn("run: lookup_ip() failed");
                        self.emitter.emit("failure.ip_lookup", library_failure(&err));
                    }
                }
            }
        } else {
            ctx.probe_ip = self.settings.probe_ip.clone();
        }

        // When probe_asn is configured the configured network name is taken
        // as well, even if empty.
        if self.settings.probe_asn.is_empty() {
            ctx.probe_asn = DEFAULT_PROBE_ASN.to_string();
            if !self.settings.no_asn_lookup {
                match geoip::lookup_asn(&self.settings.geoip_asn_path, &ctx.probe_ip) {
                    Ok((asn, network_name)) => {
                        ctx.probe_asn = asn;
                        ctx.probe_network_name = network_name;
                        self.emitter
                            .info(format!("Your ISP number: {}", ctx.probe_asn));
                        self.emitter
                            .debug(format!("Your ISP name: {}", ctx.probe_network_name));
                    }
                    Err(err) => {
                        self.emitter.warn("run: lookup_asn() failed");
                        self.emitter
                            .emit("failure.asn_lookup", library_failure(&err));
                    }
                }
            }
        } else {
            ctx.probe_network_name = self.settings.probe_network_name.clone();
            ctx.probe_asn = self.settings.probe_asn.clone();
        }

        if self.settings.probe_cc.is_empty() {
            ctx.probe_cc = DEFAULT_PROBE_CC.to_string();
            if !self.settings.no_cc_lookup {
                match geoip::lookup_cc(&self.settings.geoip_country_path, &ctx.probe_ip) {
                    Ok(cc) => {
                        ctx.probe_cc = cc;
                        self.emitter.info(format!("Your country: {}", ctx.probe_cc));
                    }
                    Err(err) => {
                        self.emitter.warn("run: lookup_cc() failed");
                        self.emitter.emit("failure.cc_lookup", library_failure(&err));
                    }
                }
            }
        } else {
            ctx.probe_cc = self.settings.probe_cc.clone();
        }
        self.progress(0.2, "geoip lookup");
        self.emitter.emit(
            "status.geoip_lookup",
            json!({
                "probe_cc": ctx.probe_cc,
                "probe_asn": ctx.probe_asn,
                "probe_ip": ctx.probe_ip,
                "probe_network_name": ctx.probe_network_name,
            }),
        );

        if !self.settings.no_resolver_lookup {
            match lookup::lookup_resolver_ip(&bytes).await {
                Ok(resolver_ip) => ctx.resolver_ip = resolver_ip,
                Err(err) => {
                    self.emitter.warn("run: lookup_resolver_ip() failed");
                    self.emitter
                        .emit("failure.resolver_lookup", library_failure(&err));
                }
            }
        }
        debug!("resolver_ip: {}", ctx.resolver_ip);
        self.progress(0.3, "resolver lookup");
        self.emitter.emit(
            "status.resolver_lookup",
            json!({ "resolver_ip": ctx.resolver_ip }),
        );

        let test_start_time = format_utc_now();
        let mut collector_base_url = String::new();
        if !self.settings.no_collector {
            if self.settings.collector_base_url.is_empty() {
                for endpoint in &ctx.collectors {
                    if endpoint.kind == EndpointType::Https {
                        self.emitter
                            .info(format!("Using discovered collector: {}", endpoint.address));
                        collector_base_url = endpoint.address.clone();
                        break;
                    }
                }
            } else {
                collector_base_url = self.settings.collector_base_url.clone();
            }
            self.emitter.info("Opening report; please be patient...");
            match collector
                .open_report(
                    &collector_base_url,
                    &test_start_time,
                    &self.settings,
                    &ctx,
                    &self.nettest.name(),
                    &self.nettest.version(),
                )
                .await
            {
                Ok(report_id) => {
                    self.emitter.info(format!("Report ID: {report_id}"));
                    ctx.report_id = report_id;
                    self.emitter.emit(
                        "status.report_create",
                        json!({ "report_id": ctx.report_id }),
                    );
                }
                Err(err) => {
                    self.emitter.warn("run: open_report() failed");
                    self.emitter
                        .emit("failure.report_create", library_failure(&err));
                }
            }
        }
        self.progress(0.4, "open report");

        if let Some(inputs) = self.prepare_inputs() {
            let parallelism = dispatch::effective_parallelism(
                self.nettest.needs_input(),
                self.settings.parallelism,
            );
            let state = Arc::new(RunState {
                settings: self.settings.clone(),
                nettest: self.nettest.clone(),
                emitter: self.emitter.clone(),
                collector: collector.clone(),
                bytes: bytes.clone(),
                ctx: ctx.clone(),
                collector_base_url: collector_base_url.clone(),
                test_start_time,
                begin: Instant::now(),
                interrupted: self.interrupted.clone(),
            });
            dispatch::dispatch(state, Arc::new(inputs), parallelism).await;
            self.progress(0.9, "measurement complete");
        }

        if !self.settings.no_collector && !ctx.report_id.is_empty() {
            match collector
                .close_report(&collector_base_url, &ctx.report_id)
                .await
            {
                Ok(()) => {
                    self.emitter
                        .emit("status.report_close", json!({ "report_id": ctx.report_id }));
                }
                Err(err) => {
                    self.emitter.warn("run: close_report() failed");
                    self.emitter
                        .emit("failure.report_close", library_failure(&err));
                }
            }
        } else if ctx.report_id.is_empty() {
            self.emitter.emit(
                "failure.report_close",
                json!({ "failure": "report_not_open_error" }),
            );
        }
        self.progress(1.0, "report close");

        self.emitter.emit(
            "status.end",
            json!({
                "failure": "",
                "downloaded_kb": bytes.down() as f64 / 1024.0,
                "uploaded_kb": bytes.up() as f64 / 1024.0,
            }),
        );
        true
    }

    /// The input list for the dispatcher, or `None` when the nettest wants
    /// input and there is none, in which case measurement is skipped.
    fn prepare_inputs(&self) -> Option<Vec<String>> {
        let mut inputs = Vec::new();
        if self.nettest.needs_input() {
            inputs.extend(self.settings.inputs.iter().cloned());
            for path in &self.settings.input_filepaths {
                match std::fs::read_to_string(path) {
                    Ok(content) => inputs.extend(
                        content
                            .lines()
                            .filter(|line| !line.trim().is_empty())
                            .map(str::to_string),
                    ),
                    Err(e) => self
                        .emitter
                        .warn(format!("run: cannot read input file '{path}': {e}")),
                }
            }
            if inputs.is_empty() {
                self.emitter.warn("run: no input provided");
                return None;
            }
        } else {
            if !self.settings.inputs.is_empty() {
                self.emitter.warn("run: got unexpected input; ignoring it");
            }
            inputs.push(String::new());
        }
        if self.settings.randomize_input {
            inputs.shuffle(&mut rand::thread_rng());
        }
        Some(inputs)
    }

    fn progress(&self, percentage: f64, message: &str) {
        self.emitter.emit(
            "status.progress",
            json!({ "percentage": percentage, "message": message }),
        );
    }
}
