//! Probe geolocation against local MMDB databases.

use std::net::IpAddr;
use std::path::Path;

use maxminddb::{MaxMindDBError, Reader};
use serde::Deserialize;
use tracing::warn;

use crate::error::{ErrContext, ErrorCode};

#[derive(Debug, Deserialize)]
struct AsnRecord {
    autonomous_system_number: Option<u32>,
    autonomous_system_organization: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CountryRecord {
    registered_country: Option<RegisteredCountry>,
}

#[derive(Debug, Deserialize)]
struct RegisteredCountry {
    iso_code: Option<String>,
}

/// Resolve `ip` to its `"AS<n>"` string and network name using the ASN
/// database at `db_path`.
pub fn lookup_asn(db_path: &str, ip: &str) -> Result<(String, String), ErrContext> {
    let record: AsnRecord = lookup_record(db_path, ip)?;
    let asn = record.autonomous_system_number.ok_or_else(no_data)?;
    let network_name = record.autonomous_system_organization.ok_or_else(no_data)?;
    Ok((format!("AS{asn}"), network_name))
}

/// Resolve `ip` to its registered-country ISO code using the country
/// database at `db_path`.
pub fn lookup_cc(db_path: &str, ip: &str) -> Result<String, ErrContext> {
    let record: CountryRecord = lookup_record(db_path, ip)?;
    record
        .registered_country
        .and_then(|country| country.iso_code)
        .ok_or_else(no_data)
}

/// Open the database memory-mapped, resolve `ip`, and drop the handle
/// before returning. No caching happens at this layer.
fn lookup_record<T>(db_path: &str, ip: &str) -> Result<T, ErrContext>
where
    T: for<'de> Deserialize<'de>,
{
    let ip: IpAddr = ip
        .parse()
        .map_err(|e: std::net::AddrParseError| ErrContext::library("std/net", "", e.to_string()))?;
    let reader = Reader::open_mmap(Path::new(db_path)).map_err(mmdb_err)?;
    match reader.lookup(ip) {
        Ok(record) => Ok(record),
        Err(MaxMindDBError::AddressNotFoundError(_)) => {
            warn!("geoip: no record for {ip}");
            Err(ErrContext::own(ErrorCode::MmdbEnoent))
        }
        Err(MaxMindDBError::DecodingError(_)) => {
            warn!("geoip: record for {ip} has an unexpected shape");
            Err(ErrContext::own(ErrorCode::MmdbEnodatafortype))
        }
        Err(e) => Err(mmdb_err(e)),
    }
}

fn mmdb_err(e: MaxMindDBError) -> ErrContext {
    ErrContext::library("maxminddb", "", e.to_string())
}

fn no_data() -> ErrContext {
    ErrContext::own(ErrorCode::MmdbEnodatafortype)
}
