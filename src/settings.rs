//! Run settings and their JSON parsing.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use thiserror::Error;

use crate::events::LogLevel;

/// Default bouncer used when the embedder does not configure one.
pub const DEFAULT_BOUNCER_BASE_URL: &str = "https://bouncer.ooni.io";

/// Default overall runtime budget, in seconds.
pub const DEFAULT_MAX_RUNTIME: u16 = 90;

/// Errors produced while parsing external settings JSON.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("json_parse_error")]
    JsonParse,
    #[error("invalid_settings_error: {0}")]
    Invalid(String),
}

/// Configuration of one run, immutable once the runner starts.
///
/// Every field is optional in the external JSON except `name`; fields under
/// the `options` object are flattened here.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub annotations: BTreeMap<String, String>,
    pub inputs: Vec<String>,
    pub input_filepaths: Vec<String>,
    pub log_filepath: String,
    pub log_level: LogLevel,
    pub name: String,
    pub output_filepath: String,
    pub all_endpoints: bool,
    pub bouncer_base_url: String,
    pub ca_bundle_path: String,
    pub collector_base_url: String,
    pub engine_name: String,
    pub engine_version: String,
    pub engine_version_full: String,
    pub geoip_asn_path: String,
    pub geoip_country_path: String,
    pub max_runtime: u16,
    pub no_asn_lookup: bool,
    pub no_bouncer: bool,
    pub no_cc_lookup: bool,
    pub no_collector: bool,
    pub no_file_report: bool,
    pub no_ip_lookup: bool,
    pub no_resolver_lookup: bool,
    pub parallelism: u8,
    pub platform: String,
    pub port: u16,
    pub probe_ip: String,
    pub probe_asn: String,
    pub probe_network_name: String,
    pub probe_cc: String,
    pub randomize_input: bool,
    pub save_real_probe_asn: bool,
    pub save_real_probe_ip: bool,
    pub save_real_probe_cc: bool,
    pub save_real_resolver_ip: bool,
    pub server: String,
    pub software_name: String,
    pub software_version: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            annotations: BTreeMap::new(),
            inputs: Vec::new(),
            input_filepaths: Vec::new(),
            log_filepath: String::new(),
            log_level: LogLevel::Warning,
            name: String::new(),
            output_filepath: String::new(),
            all_endpoints: false,
            bouncer_base_url: DEFAULT_BOUNCER_BASE_URL.to_string(),
            ca_bundle_path: String::new(),
            collector_base_url: String::new(),
            engine_name: crate::default_engine_name().to_string(),
            engine_version: crate::version().to_string(),
            engine_version_full: crate::version().to_string(),
            geoip_asn_path: String::new(),
            geoip_country_path: String::new(),
            max_runtime: DEFAULT_MAX_RUNTIME,
            no_asn_lookup: false,
            no_bouncer: false,
            no_cc_lookup: false,
            no_collector: false,
            no_file_report: false,
            no_ip_lookup: false,
            no_resolver_lookup: false,
            parallelism: 0,
            platform: String::new(),
            port: 0,
            probe_ip: String::new(),
            probe_asn: String::new(),
            probe_network_name: String::new(),
            probe_cc: String::new(),
            randomize_input: true,
            save_real_probe_asn: true,
            save_real_probe_ip: false,
            save_real_probe_cc: true,
            save_real_resolver_ip: true,
            server: String::new(),
            software_name: crate::default_engine_name().to_string(),
            software_version: crate::version().to_string(),
        }
    }
}

impl Settings {
    /// Serialize back to the external shape: top-level fields plus an
    /// `options` object. Parsing the result yields equivalent settings.
    pub fn to_json(&self) -> Value {
        json!({
            "annotations": self.annotations,
            "inputs": self.inputs,
            "input_filepaths": self.input_filepaths,
            "log_filepath": self.log_filepath,
            "log_level": self.log_level.as_str(),
            "name": self.name,
            "output_filepath": self.output_filepath,
            "options": {
                "all_endpoints": self.all_endpoints,
                "bouncer_base_url": self.bouncer_base_url,
                "ca_bundle_path": self.ca_bundle_path,
                "collector_base_url": self.collector_base_url,
                "engine_name": self.engine_name,
                "engine_version": self.engine_version,
                "engine_version_full": self.engine_version_full,
                "geoip_asn_path": self.geoip_asn_path,
                "geoip_country_path": self.geoip_country_path,
                "max_runtime": self.max_runtime,
                "no_asn_lookup": self.no_asn_lookup,
                "no_bouncer": self.no_bouncer,
                "no_cc_lookup": self.no_cc_lookup,
                "no_collector": self.no_collector,
                "no_file_report": self.no_file_report,
                "no_ip_lookup": self.no_ip_lookup,
                "no_resolver_lookup": self.no_resolver_lookup,
                "parallelism": self.parallelism,
                "platform": self.platform,
                "port": self.port,
                "probe_ip": self.probe_ip,
                "probe_asn": self.probe_asn,
                "probe_network_name": self.probe_network_name,
                "probe_cc": self.probe_cc,
                "randomize_input": self.randomize_input,
                "save_real_probe_asn": self.save_real_probe_asn,
                "save_real_probe_ip": self.save_real_probe_ip,
                "save_real_probe_cc": self.save_real_probe_cc,
                "save_real_resolver_ip": self.save_real_resolver_ip,
                "server": self.server,
                "software_name": self.software_name,
                "software_version": self.software_version,
            },
        })
    }
}

/// Parse external settings JSON.
///
/// Returns the parsed settings together with deprecation warnings, currently
/// produced when a numeric value is coerced into a boolean option.
pub fn parse_settings(input: &str) -> Result<(Settings, Vec<String>), SettingsError> {
    let doc: Value = serde_json::from_str(input).map_err(|_| SettingsError::JsonParse)?;
    if !doc.is_object() {
        return Err(SettingsError::Invalid(
            "JSON document is not an object".to_string(),
        ));
    }
    match doc.get("options") {
        None => {
            return Err(SettingsError::Invalid(
                "missing 'options' entry".to_string(),
            ))
        }
        Some(options) if !options.is_object() => {
            return Err(SettingsError::Invalid(
                "'options' entry is not an object".to_string(),
            ))
        }
        Some(_) => {}
    }
    match doc.get("name") {
        None => return Err(SettingsError::Invalid("missing 'name' entry".to_string())),
        Some(name) if !name.is_string() => {
            return Err(SettingsError::Invalid(
                "'name' entry is not a string".to_string(),
            ))
        }
        Some(_) => {}
    }

    let mut settings = Settings::default();
    let mut warnings = Vec::new();

    read_string_map(&doc, "/annotations", &mut settings.annotations)?;
    read_string_list(&doc, "/inputs", &mut settings.inputs)?;
    read_string_list(&doc, "/input_filepaths", &mut settings.input_filepaths)?;
    read_string(&doc, "/log_filepath", &mut settings.log_filepath)?;
    read_log_level(&doc, "/log_level", &mut settings.log_level)?;
    read_string(&doc, "/name", &mut settings.name)?;
    read_string(&doc, "/output_filepath", &mut settings.output_filepath)?;

    read_bool(&doc, "/options/all_endpoints", &mut settings.all_endpoints, &mut warnings)?;
    read_string(&doc, "/options/bouncer_base_url", &mut settings.bouncer_base_url)?;
    read_string(&doc, "/options/ca_bundle_path", &mut settings.ca_bundle_path)?;
    read_string(&doc, "/options/collector_base_url", &mut settings.collector_base_url)?;
    read_string(&doc, "/options/engine_name", &mut settings.engine_name)?;
    read_string(&doc, "/options/engine_version", &mut settings.engine_version)?;
    read_string(&doc, "/options/engine_version_full", &mut settings.engine_version_full)?;
    read_string(&doc, "/options/geoip_asn_path", &mut settings.geoip_asn_path)?;
    read_string(&doc, "/options/geoip_country_path", &mut settings.geoip_country_path)?;
    read_u16(&doc, "/options/max_runtime", &mut settings.max_runtime)?;
    read_bool(&doc, "/options/no_asn_lookup", &mut settings.no_asn_lookup, &mut warnings)?;
    read_bool(&doc, "/options/no_bouncer", &mut settings.no_bouncer, &mut warnings)?;
    read_bool(&doc, "/options/no_cc_lookup", &mut settings.no_cc_lookup, &mut warnings)?;
    read_bool(&doc, "/options/no_collector", &mut settings.no_collector, &mut warnings)?;
    read_bool(&doc, "/options/no_file_report", &mut settings.no_file_report, &mut warnings)?;
    read_bool(&doc, "/options/no_ip_lookup", &mut settings.no_ip_lookup, &mut warnings)?;
    read_bool(&doc, "/options/no_resolver_lookup", &mut settings.no_resolver_lookup, &mut warnings)?;
    read_u8(&doc, "/options/parallelism", &mut settings.parallelism)?;
    read_string(&doc, "/options/platform", &mut settings.platform)?;
    read_u16(&doc, "/options/port", &mut settings.port)?;
    read_string(&doc, "/options/probe_ip", &mut settings.probe_ip)?;
    read_string(&doc, "/options/probe_asn", &mut settings.probe_asn)?;
    read_string(&doc, "/options/probe_network_name", &mut settings.probe_network_name)?;
    read_string(&doc, "/options/probe_cc", &mut settings.probe_cc)?;
    read_bool(&doc, "/options/randomize_input", &mut settings.randomize_input, &mut warnings)?;
    read_bool(&doc, "/options/save_real_probe_asn", &mut settings.save_real_probe_asn, &mut warnings)?;
    read_bool(&doc, "/options/save_real_probe_ip", &mut settings.save_real_probe_ip, &mut warnings)?;
    read_bool(&doc, "/options/save_real_probe_cc", &mut settings.save_real_probe_cc, &mut warnings)?;
    read_bool(&doc, "/options/save_real_resolver_ip", &mut settings.save_real_resolver_ip, &mut warnings)?;
    read_string(&doc, "/options/server", &mut settings.server)?;
    read_string(&doc, "/options/software_name", &mut settings.software_name)?;
    read_string(&doc, "/options/software_version", &mut settings.software_version)?;

    Ok((settings, warnings))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn conversion_error(ptr: &str, found: &Value, wanted: &str) -> SettingsError {
    SettingsError::Invalid(format!(
        "cannot convert variable accessed using '{ptr}' as JSON pointer \
         from JSON type '{}' to '{wanted}'",
        json_type_name(found)
    ))
}

fn read_string(doc: &Value, ptr: &str, dest: &mut String) -> Result<(), SettingsError> {
    match doc.pointer(ptr) {
        None => Ok(()),
        Some(Value::String(value)) => {
            *dest = value.clone();
            Ok(())
        }
        Some(other) => Err(conversion_error(ptr, other, "string")),
    }
}

fn read_string_list(doc: &Value, ptr: &str, dest: &mut Vec<String>) -> Result<(), SettingsError> {
    match doc.pointer(ptr) {
        None => Ok(()),
        Some(Value::Array(values)) => {
            let mut list = Vec::with_capacity(values.len());
            for value in values {
                match value {
                    Value::String(value) => list.push(value.clone()),
                    other => return Err(conversion_error(ptr, other, "list of strings")),
                }
            }
            *dest = list;
            Ok(())
        }
        Some(other) => Err(conversion_error(ptr, other, "list of strings")),
    }
}

fn read_string_map(
    doc: &Value,
    ptr: &str,
    dest: &mut BTreeMap<String, String>,
) -> Result<(), SettingsError> {
    match doc.pointer(ptr) {
        None => Ok(()),
        Some(Value::Object(entries)) => {
            let mut map = BTreeMap::new();
            for (key, value) in entries {
                match value {
                    Value::String(value) => {
                        map.insert(key.clone(), value.clone());
                    }
                    other => return Err(conversion_error(ptr, other, "map of strings")),
                }
            }
            *dest = map;
            Ok(())
        }
        Some(other) => Err(conversion_error(ptr, other, "map of strings")),
    }
}

fn read_bool(
    doc: &Value,
    ptr: &str,
    dest: &mut bool,
    warnings: &mut Vec<String>,
) -> Result<(), SettingsError> {
    match doc.pointer(ptr) {
        None => Ok(()),
        Some(Value::Bool(value)) => {
            *dest = *value;
            Ok(())
        }
        // Old embedders used integers where booleans belong. Coerce and
        // complain until they migrate.
        Some(Value::Number(value)) => {
            warnings.push(format!(
                "found number variable at '{ptr}' and treating it as a boolean; \
                 this backward compatibility hack will be removed in the future, \
                 change your code to use a real boolean"
            ));
            *dest = value.as_f64().unwrap_or(0.0) != 0.0;
            Ok(())
        }
        Some(other) => Err(conversion_error(ptr, other, "bool")),
    }
}

fn read_unsigned(doc: &Value, ptr: &str, maximum: f64) -> Result<Option<u64>, SettingsError> {
    let value = match doc.pointer(ptr) {
        None => return Ok(None),
        Some(Value::Number(value)) => value.as_f64().unwrap_or(f64::NAN),
        Some(other) => return Err(conversion_error(ptr, other, "number")),
    };
    if value.fract() != 0.0 || value.is_nan() {
        return Err(SettingsError::Invalid(format!(
            "cannot validate variable accessed using '{ptr}' because the \
             variable should be an integer but a floating point number was provided"
        )));
    }
    if value < 0.0 || value > maximum {
        return Err(SettingsError::Invalid(format!(
            "cannot validate variable accessed using '{ptr}' because the value \
             is out of range (minimum 0, maximum {maximum})"
        )));
    }
    Ok(Some(value as u64))
}

fn read_u8(doc: &Value, ptr: &str, dest: &mut u8) -> Result<(), SettingsError> {
    if let Some(value) = read_unsigned(doc, ptr, f64::from(u8::MAX))? {
        *dest = value as u8;
    }
    Ok(())
}

fn read_u16(doc: &Value, ptr: &str, dest: &mut u16) -> Result<(), SettingsError> {
    if let Some(value) = read_unsigned(doc, ptr, f64::from(u16::MAX))? {
        *dest = value as u16;
    }
    Ok(())
}

fn read_log_level(doc: &Value, ptr: &str, dest: &mut LogLevel) -> Result<(), SettingsError> {
    let mut name = String::new();
    read_string(doc, ptr, &mut name)?;
    if name.is_empty() {
        return Ok(());
    }
    match LogLevel::from_name(&name) {
        Some(level) => {
            *dest = level;
            Ok(())
        }
        None => Err(SettingsError::Invalid(format!(
            "cannot convert variable accessed using '{ptr}' as JSON pointer \
             to one of: QUIET, ERR, WARNING, INFO, DEBUG, DEBUG2"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_yields_defaults() {
        let (settings, warnings) =
            parse_settings(r#"{"name": "dummy", "options": {}}"#).expect("parse");
        assert_eq!(settings.name, "dummy");
        assert_eq!(settings.bouncer_base_url, DEFAULT_BOUNCER_BASE_URL);
        assert_eq!(settings.max_runtime, DEFAULT_MAX_RUNTIME);
        assert_eq!(settings.log_level, LogLevel::Warning);
        assert!(settings.randomize_input);
        assert!(settings.save_real_probe_asn);
        assert!(!settings.save_real_probe_ip);
        assert!(warnings.is_empty());
    }

    #[test]
    fn full_document_is_read() {
        let input = r#"{
            "annotations": {"campaign": "spring"},
            "inputs": ["https://example.com/"],
            "input_filepaths": ["/tmp/inputs.txt"],
            "log_level": "DEBUG",
            "name": "web_connectivity",
            "options": {
                "bouncer_base_url": "https://bouncer.example.org/",
                "collector_base_url": "https://collector.example.org",
                "max_runtime": 30,
                "no_collector": true,
                "parallelism": 7,
                "probe_cc": "IT",
                "randomize_input": false
            }
        }"#;
        let (settings, warnings) = parse_settings(input).expect("parse");
        assert_eq!(settings.annotations["campaign"], "spring");
        assert_eq!(settings.inputs, vec!["https://example.com/".to_string()]);
        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.name, "web_connectivity");
        assert_eq!(settings.bouncer_base_url, "https://bouncer.example.org/");
        assert_eq!(settings.max_runtime, 30);
        assert!(settings.no_collector);
        assert_eq!(settings.parallelism, 7);
        assert_eq!(settings.probe_cc, "IT");
        assert!(!settings.randomize_input);
        assert!(warnings.is_empty());
    }

    #[test]
    fn numbers_coerce_to_booleans_with_a_warning() {
        let input = r#"{"name": "dummy", "options": {"no_bouncer": 1, "no_collector": 0}}"#;
        let (settings, warnings) = parse_settings(input).expect("parse");
        assert!(settings.no_bouncer);
        assert!(!settings.no_collector);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("/options/no_bouncer"));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = parse_settings("{not json").unwrap_err();
        assert!(matches!(err, SettingsError::JsonParse));
    }

    #[test]
    fn missing_name_or_options_is_invalid() {
        let err = parse_settings(r#"{"options": {}}"#).unwrap_err();
        assert!(err.to_string().contains("missing 'name'"));
        let err = parse_settings(r#"{"name": "dummy"}"#).unwrap_err();
        assert!(err.to_string().contains("missing 'options'"));
    }

    #[test]
    fn fractional_integer_is_invalid() {
        let err =
            parse_settings(r#"{"name": "x", "options": {"max_runtime": 1.5}}"#).unwrap_err();
        assert!(err.to_string().contains("should be an integer"));
    }

    #[test]
    fn out_of_range_integer_is_invalid() {
        let err =
            parse_settings(r#"{"name": "x", "options": {"parallelism": 256}}"#).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn wrong_type_is_invalid() {
        let err = parse_settings(r#"{"name": "x", "options": {"probe_cc": 42}}"#).unwrap_err();
        assert!(err.to_string().contains("/options/probe_cc"));
    }

    #[test]
    fn unknown_log_level_is_invalid() {
        let err =
            parse_settings(r#"{"name": "x", "log_level": "LOUD", "options": {}}"#).unwrap_err();
        assert!(err.to_string().contains("QUIET, ERR, WARNING"));
    }

    #[test]
    fn settings_round_trip_through_json() {
        let input = r#"{
            "annotations": {"k": "v"},
            "inputs": ["a", "b"],
            "log_level": "INFO",
            "name": "dummy",
            "options": {
                "max_runtime": 10,
                "no_bouncer": true,
                "parallelism": 2,
                "probe_ip": "1.2.3.4",
                "save_real_probe_ip": true
            }
        }"#;
        let (settings, _) = parse_settings(input).expect("parse");
        let serialized = settings.to_json().to_string();
        let (reparsed, warnings) = parse_settings(&serialized).expect("reparse");
        assert_eq!(settings, reparsed);
        assert!(warnings.is_empty());
    }
}
