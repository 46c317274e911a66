use std::path::Path;

use crate::error::{Error, Result};
use crate::types::RouterConfig;

/// Load and validate a router configuration from a TOML file.
///
/// Validation enforces the invariants spec.md §3 assumes of the static
/// configuration: interface names fit in 31 bytes and are unique, every
/// route's `interface` names a configured interface, at least one interface
/// exists, and, when NAT is enabled, the configured internal interface
/// actually exists and the port range is non-empty.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<RouterConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.display().to_string(),
        source,
    })?;
    let config: RouterConfig = toml::from_str(&contents).map_err(|source| Error::Parse {
        path: path.display().to_string(),
        source,
    })?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &RouterConfig) -> Result<()> {
    if config.interfaces.is_empty() {
        return Err(Error::NoInterfaces);
    }

    let mut seen = std::collections::HashSet::new();
    for iface in &config.interfaces {
        if iface.name.len() > 31 {
            return Err(Error::InterfaceNameTooLong(iface.name.clone()));
        }
        if !seen.insert(iface.name.as_str()) {
            return Err(Error::DuplicateInterface(iface.name.clone()));
        }
    }

    for route in &config.routes {
        if !seen.contains(route.interface.as_str()) {
            return Err(Error::UnknownRouteInterface {
                dest: route.dest.to_string(),
                interface: route.interface.clone(),
            });
        }
    }

    if config.nat.enabled {
        if !seen.contains(config.nat.internal_interface.as_str()) {
            return Err(Error::UnknownInternalInterface(
                config.nat.internal_interface.clone(),
            ));
        }
        if config.nat.port_range_start >= config.nat.port_range_end {
            return Err(Error::InvalidPortRange {
                start: config.nat.port_range_start,
                end: config.nat.port_range_end,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_TOML: &str = r#"
        [[interfaces]]
        name = "eth1"
        mac = "00:00:00:00:00:01"
        ip = "10.0.1.11"

        [[interfaces]]
        name = "eth3"
        mac = "00:00:00:00:00:03"
        ip = "107.23.115.113"

        [[routes]]
        dest = "0.0.0.0"
        mask = "0.0.0.0"
        gateway = "107.23.115.131"
        interface = "eth3"

        [nat]
        enabled = true
        internal_interface = "eth1"
    "#;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_valid_config() {
        let file = write_temp(VALID_TOML);
        let config = load_from_file(file.path()).unwrap();
        assert_eq!(config.interfaces.len(), 2);
        assert_eq!(config.routes.len(), 1);
        assert!(config.nat.enabled);
    }

    #[test]
    fn rejects_route_to_unknown_interface() {
        let toml = VALID_TOML.replace("interface = \"eth3\"", "interface = \"eth9\"");
        let file = write_temp(&toml);
        let err = load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::UnknownRouteInterface { .. }));
    }

    #[test]
    fn rejects_nat_internal_interface_not_configured() {
        let toml = VALID_TOML.replace("internal_interface = \"eth1\"", "internal_interface = \"eth9\"");
        let file = write_temp(&toml);
        let err = load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::UnknownInternalInterface(_)));
    }

    #[test]
    fn rejects_duplicate_interface_names() {
        let toml = VALID_TOML.replacen("eth3", "eth1", 1);
        let file = write_temp(&toml);
        let err = load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::DuplicateInterface(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_from_file("/nonexistent/router.toml").unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
