/// Errors that can occur while loading or validating router configuration.
///
/// These are startup-time errors only. Per-packet outcomes (drops, generated
/// ICMP diagnostics) are never surfaced through `Result`; see the error
/// taxonomy in the core specification.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("interface name '{0}' exceeds 31 bytes")]
    InterfaceNameTooLong(String),

    #[error("duplicate interface name '{0}'")]
    DuplicateInterface(String),

    #[error("route for {dest} references unknown interface '{interface}'")]
    UnknownRouteInterface { dest: String, interface: String },

    #[error("no interfaces configured")]
    NoInterfaces,

    #[error("NAT is enabled but internal interface '{0}' is not configured")]
    UnknownInternalInterface(String),

    #[error("NAT port range is empty or inverted: {start}..={end}")]
    InvalidPortRange { start: u16, end: u16 },
}

pub type Result<T> = std::result::Result<T, Error>;
