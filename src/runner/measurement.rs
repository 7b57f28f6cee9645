//! Construction and submission of one measurement record.

use std::collections::BTreeMap;
use std::time::Instant;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{format_utc_now, platform_name, RunState};
use crate::{
    error::library_failure,
    nettest::{EndpointInfo, EndpointType, TestKeys},
};

/// Measure one input end to end: emit the start event, run the nettest,
/// assemble the record, submit it, and emit the trailing events.
pub(crate) async fn measure_one(state: &RunState, idx: u32, input: &str) {
    state
        .emitter
        .emit("status.measurement_start", json!({ "idx": idx, "input": input }));

    let mut measurement = build_record(state, input);
    let mut test_keys = TestKeys::new();
    let started = Instant::now();
    let outcome = state
        .nettest
        .run(&state.settings, &state.ctx, input, &mut test_keys, &state.bytes)
        .await;
    measurement.insert(
        "test_runtime".to_string(),
        json!(started.elapsed().as_secs_f64()),
    );
    // Written after the nettest returns, so a nettest cannot override the
    // resolver the runner discovered.
    test_keys.insert(
        "client_resolver".to_string(),
        json!(gated(&state.ctx.resolver_ip, state.settings.save_real_resolver_ip)),
    );
    measurement.insert("test_keys".to_string(), Value::Object(test_keys));

    if let Err(e) = outcome {
        state.emitter.warn(format!("run: nettest failed: {e:#}"));
        state.emitter.emit(
            "failure.measurement",
            json!({ "failure": "generic_error", "idx": idx }),
        );
    }

    match serde_json::to_string(&Value::Object(measurement)) {
        Ok(serialized) => {
            submit(state, idx, &serialized).await;
            // Emitted after the submission attempt so consumers observing
            // this event know the collector already saw the record.
            state
                .emitter
                .emit("measurement", json!({ "idx": idx, "json_str": serialized }));
        }
        Err(e) => {
            state
                .emitter
                .warn(format!("run: cannot serialize measurement: {e}"));
        }
    }
    state
        .emitter
        .emit("status.measurement_done", json!({ "idx": idx }));
}

async fn submit(state: &RunState, idx: u32, serialized: &str) {
    if !state.settings.no_collector && !state.ctx.report_id.is_empty() {
        match state
            .collector
            .update_report(&state.collector_base_url, &state.ctx.report_id, serialized)
            .await
        {
            Ok(()) => {
                state
                    .emitter
                    .emit("status.measurement_submission", json!({ "idx": idx }));
            }
            Err(err) => {
                state.emitter.warn("run: update_report() failed");
                let mut payload = library_failure(&err);
                payload["idx"] = json!(idx);
                payload["json_str"] = json!(serialized);
                state.emitter.emit("failure.measurement_submission", payload);
            }
        }
    } else if state.ctx.report_id.is_empty() {
        state.emitter.emit(
            "failure.measurement_submission",
            json!({ "failure": "report_not_open_error", "idx": idx }),
        );
    }
}

/// Assemble the static part of the record, everything except the keys the
/// nettest itself produces.
pub(crate) fn build_record(state: &RunState, input: &str) -> Map<String, Value> {
    let settings = &state.settings;
    let ctx = &state.ctx;
    let mut annotations: BTreeMap<String, String> = settings.annotations.clone();
    annotations.insert("engine_name".to_string(), settings.engine_name.clone());
    annotations.insert("engine_version".to_string(), settings.engine_version.clone());
    annotations.insert(
        "engine_version_full".to_string(),
        settings.engine_version_full.clone(),
    );
    annotations.insert(
        "platform".to_string(),
        if settings.platform.is_empty() {
            platform_name().to_string()
        } else {
            settings.platform.clone()
        },
    );
    annotations.insert(
        "probe_network_name".to_string(),
        gated(&ctx.probe_network_name, settings.save_real_probe_asn),
    );

    let mut record = Map::new();
    record.insert("annotations".to_string(), json!(annotations));
    record.insert("id".to_string(), json!(Uuid::new_v4().to_string()));
    record.insert("input".to_string(), json!(input));
    record.insert("input_hashes".to_string(), json!([]));
    record.insert(
        "measurement_start_time".to_string(),
        json!(format_utc_now()),
    );
    record.insert("options".to_string(), json!([]));
    record.insert(
        "probe_asn".to_string(),
        json!(gated(&ctx.probe_asn, settings.save_real_probe_asn)),
    );
    record.insert(
        "probe_cc".to_string(),
        json!(gated(&ctx.probe_cc, settings.save_real_probe_cc)),
    );
    record.insert("probe_city".to_string(), Value::Null);
    record.insert(
        "probe_ip".to_string(),
        json!(gated(&ctx.probe_ip, settings.save_real_probe_ip)),
    );
    record.insert("report_id".to_string(), json!(ctx.report_id));
    record.insert("software_name".to_string(), json!(settings.software_name));
    record.insert(
        "software_version".to_string(),
        json!(settings.software_version),
    );
    record.insert(
        "test_helpers".to_string(),
        helpers_object(&ctx.test_helpers),
    );
    record.insert("test_name".to_string(), json!(state.nettest.name()));
    record.insert("test_start_time".to_string(), json!(state.test_start_time));
    record.insert("test_version".to_string(), json!(state.nettest.version()));
    record
}

fn gated(value: &str, save: bool) -> String {
    if save {
        value.to_string()
    } else {
        String::new()
    }
}

/// One object per helper name; when discovery returned several endpoints
/// for a name, the last one wins.
fn helpers_object(helpers: &BTreeMap<String, Vec<EndpointInfo>>) -> Value {
    let mut object = Map::new();
    for (name, endpoints) in helpers {
        for endpoint in endpoints {
            let mut entry = Map::new();
            entry.insert("address".to_string(), json!(endpoint.address));
            match endpoint.kind {
                EndpointType::Onion => {
                    entry.insert("type".to_string(), json!("onion"));
                }
                EndpointType::Https => {
                    entry.insert("type".to_string(), json!("https"));
                }
                EndpointType::Cloudfront => {
                    entry.insert("type".to_string(), json!("cloudfront"));
                    entry.insert("front".to_string(), json!(endpoint.front));
                }
                EndpointType::None => {}
            }
            object.insert(name.clone(), Value::Object(entry));
        }
    }
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;
    use crate::{
        backend::CollectorClient,
        bytes::BytesInfo,
        events::{CollectingSink, Emitter, LogLevel},
        http::HttpClient,
        nettest::{DummyNettest, NettestContext},
        settings::Settings,
    };

    fn state_with(settings: Settings, ctx: NettestContext) -> RunState {
        let emitter = Emitter::new(Box::new(CollectingSink::new()), LogLevel::Warning);
        let bytes = Arc::new(BytesInfo::new());
        let http = HttpClient::new(emitter.clone(), bytes.clone(), "");
        RunState {
            settings,
            nettest: Arc::new(DummyNettest),
            emitter,
            collector: CollectorClient::new(http),
            bytes,
            ctx,
            collector_base_url: String::new(),
            test_start_time: "2018-11-01 10:00:00".to_string(),
            begin: Instant::now(),
            interrupted: Arc::new(portable_atomic::AtomicBool::new(false)),
        }
    }

    fn populated_ctx() -> NettestContext {
        NettestContext {
            probe_asn: "AS30722".to_string(),
            probe_cc: "IT".to_string(),
            probe_ip: "93.147.1.1".to_string(),
            probe_network_name: "Vodafone Italia".to_string(),
            resolver_ip: "10.0.0.1".to_string(),
            report_id: "20181101T100000Z_AS30722_x".to_string(),
            ..NettestContext::default()
        }
    }

    #[test]
    fn save_flags_gate_probe_fields() {
        let settings = Settings {
            save_real_probe_ip: false,
            save_real_probe_asn: true,
            save_real_probe_cc: false,
            ..Settings::default()
        };
        let state = state_with(settings, populated_ctx());
        let record = build_record(&state, "");
        assert_eq!(record["probe_ip"], "");
        assert_eq!(record["probe_asn"], "AS30722");
        assert_eq!(record["probe_cc"], "");
        assert_eq!(record["annotations"]["probe_network_name"], "Vodafone Italia");
    }

    #[test]
    fn suppressed_asn_also_suppresses_the_network_name_annotation() {
        let settings = Settings {
            save_real_probe_asn: false,
            ..Settings::default()
        };
        let state = state_with(settings, populated_ctx());
        let record = build_record(&state, "");
        assert_eq!(record["probe_asn"], "");
        assert_eq!(record["annotations"]["probe_network_name"], "");
    }

    #[test]
    fn record_ids_are_v4_uuids() {
        let state = state_with(Settings::default(), populated_ctx());
        let record = build_record(&state, "");
        let id = record["id"].as_str().expect("id is a string");
        let uuid = Uuid::parse_str(id).expect("valid uuid");
        assert_eq!(uuid.get_version_num(), 4);
    }

    #[test]
    fn start_time_has_no_fractional_seconds() {
        let state = state_with(Settings::default(), populated_ctx());
        let record = build_record(&state, "");
        let start_time = record["measurement_start_time"]
            .as_str()
            .expect("string");
        chrono::NaiveDateTime::parse_from_str(start_time, "%Y-%m-%d %H:%M:%S")
            .expect("exact format");
        assert!(!start_time.contains('.'));
    }

    #[test]
    fn fixed_fields_are_present() {
        let state = state_with(Settings::default(), populated_ctx());
        let record = build_record(&state, "https://example.com/");
        assert_eq!(record["input"], "https://example.com/");
        assert_eq!(record["input_hashes"], json!([]));
        assert_eq!(record["options"], json!([]));
        assert_eq!(record["probe_city"], Value::Null);
        assert_eq!(record["report_id"], "20181101T100000Z_AS30722_x");
        assert_eq!(record["test_start_time"], "2018-11-01 10:00:00");
    }

    #[test]
    fn helpers_are_rendered_with_type_and_front() {
        let mut ctx = populated_ctx();
        ctx.test_helpers.insert(
            "backend".to_string(),
            vec![EndpointInfo {
                kind: EndpointType::Cloudfront,
                address: "https://x.cloudfront.example".to_string(),
                front: "front.example".to_string(),
            }],
        );
        ctx.test_helpers.insert(
            "web-connectivity".to_string(),
            vec![
                EndpointInfo {
                    kind: EndpointType::Onion,
                    address: "httpo://old.onion".to_string(),
                    front: String::new(),
                },
                EndpointInfo {
                    kind: EndpointType::Https,
                    address: "https://helper.example".to_string(),
                    front: String::new(),
                },
            ],
        );
        let state = state_with(Settings::default(), ctx);
        let record = build_record(&state, "");
        let helpers = &record["test_helpers"];
        assert_eq!(helpers["backend"]["type"], "cloudfront");
        assert_eq!(helpers["backend"]["front"], "front.example");
        // The last discovered endpoint for a name wins.
        assert_eq!(helpers["web-connectivity"]["type"], "https");
        assert_eq!(helpers["web-connectivity"]["address"], "https://helper.example");
    }
}
