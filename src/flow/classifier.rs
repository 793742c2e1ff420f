// Flow directionality from private address ranges
use std::fmt;
use std::net::Ipv4Addr;

/// Whether an address falls into 10/8, 172.16/12, 127/8 or 192.168/16
///
/// Anything that is not a dotted-quad IPv4 address counts as external.
pub fn is_internal(address: &str) -> bool {
    match address.trim().parse::<Ipv4Addr>() {
        Ok(ip) => ip.is_private() || ip.is_loopback(),
        Err(_) => false,
    }
}

/// Which side(s) of a flow sit inside the private network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    BothInternal,
    InternalToExternal,
    ExternalToInternal,
    BothExternal,
}

impl FlowDirection {
    /// Only flows that never leave the private network count as internal
    pub fn is_internal(&self) -> bool {
        matches!(self, FlowDirection::BothInternal)
    }

    /// `(internal, external)` endpoints for flows crossing the boundary
    pub fn trace_endpoints<'a>(
        &self,
        source: &'a str,
        destination: &'a str,
    ) -> Option<(&'a str, &'a str)> {
        match self {
            FlowDirection::InternalToExternal => Some((source, destination)),
            FlowDirection::ExternalToInternal => Some((destination, source)),
            FlowDirection::BothInternal | FlowDirection::BothExternal => None,
        }
    }
}

impl fmt::Display for FlowDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FlowDirection::BothInternal => "internal/internal",
            FlowDirection::InternalToExternal => "internal/external",
            FlowDirection::ExternalToInternal => "external/internal",
            FlowDirection::BothExternal => "external/external",
        };
        f.write_str(label)
    }
}

/// Classify a flow by its source and destination addresses
pub fn classify(source: &str, destination: &str) -> FlowDirection {
    match (is_internal(source), is_internal(destination)) {
        (true, true) => FlowDirection::BothInternal,
        (true, false) => FlowDirection::InternalToExternal,
        (false, true) => FlowDirection::ExternalToInternal,
        (false, false) => FlowDirection::BothExternal,
    }
}
