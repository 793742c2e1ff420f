// Hop line parsing for traceroute-style output
//
// Accepted: `<index> <ipv4>` followed by at least three numeric latencies,
// each optionally suffixed with `ms`. Lost probes (`*`), extra per-probe
// addresses and annotations between the latencies are ignored. Headers,
// `* * *` timeouts and anything with fewer than three latencies are rejected.

use crate::error::{HopscopeError, Result};
use regex::Regex;
use std::net::Ipv4Addr;

const HOP_LINE_PATTERN: &str = r"^\s*(\d+)\s+(\d{1,3}(?:\.\d{1,3}){3})(?:\s+(.*))?$";

const MIN_LATENCIES: usize = 3;

/// One intermediate router reported by the hop-discovery tool
#[derive(Debug, Clone, PartialEq)]
pub struct Hop {
    pub index: u32,
    pub address: String,
    pub latencies_ms: Vec<f64>,
}

/// Pre-compiled hop line matcher
#[derive(Debug, Clone)]
pub struct HopLineParser {
    pattern: Regex,
}

impl HopLineParser {
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(HOP_LINE_PATTERN)
            .map_err(|e| HopscopeError::Trace(format!("Invalid hop line pattern: {}", e)))?;
        Ok(Self { pattern })
    }

    /// Parse a single output line, `None` when it is not a hop line
    pub fn parse(&self, line: &str) -> Option<Hop> {
        let captures = self.pattern.captures(line)?;

        let index = captures.get(1)?.as_str().parse().ok()?;
        let address = captures.get(2)?.as_str();
        address.parse::<Ipv4Addr>().ok()?;

        let latencies_ms: Vec<f64> = captures
            .get(3)
            .map_or("", |rest| rest.as_str())
            .split_whitespace()
            .filter_map(parse_latency)
            .collect();

        if latencies_ms.len() < MIN_LATENCIES {
            return None;
        }

        Some(Hop {
            index,
            address: address.to_string(),
            latencies_ms,
        })
    }
}

/// `1.234`, `20ms` or `7`; addresses, `*`, `ms` and annotations yield `None`
fn parse_latency(token: &str) -> Option<f64> {
    let number = token.strip_suffix("ms").unwrap_or(token);
    if number.is_empty() || number.matches('.').count() > 1 {
        return None;
    }
    if !number.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    number.parse().ok()
}
