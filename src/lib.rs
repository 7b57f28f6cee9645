pub mod backend;
pub mod bytes;
pub mod error;
pub mod events;
pub mod geoip;
pub mod http;
pub mod nettest;
pub mod runner;
pub mod settings;

// Re-export the types embedders interact with.
pub use bytes::BytesInfo;
pub use error::{ErrContext, ErrorCode};
pub use events::{CollectingSink, Emitter, EventSink, LogLevel, StderrSink};
pub use nettest::{DummyNettest, EndpointInfo, EndpointType, Nettest, NettestContext, TestKeys};
pub use runner::Runner;
pub use settings::{parse_settings, Settings, SettingsError};

/// Name reported as the default engine.
pub fn default_engine_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

/// Version of this engine.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
