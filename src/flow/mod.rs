//! Flow records and their augmented form
//!
//! An [`AugmentedFlow`] is created once per directional address pair and
//! shared by reference. Its route list keeps growing while a hop trace runs;
//! the trace status tells holders whether more hops can still arrive.

mod classifier;
mod enricher;

pub use classifier::{classify, is_internal, FlowDirection};
pub use enricher::FlowEnricher;

use crate::geo::{IpSnapshot, ResolvedIp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// Traffic volume counters over fixed windows
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Sizes {
    #[serde(rename = "last2Seconds", default)]
    pub last_2_seconds: f64,
    #[serde(rename = "last10Seconds", default)]
    pub last_10_seconds: f64,
    #[serde(rename = "last40Seconds", default)]
    pub last_40_seconds: f64,
    #[serde(default)]
    pub cumulative: f64,
}

/// Inbound flow message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    #[serde(rename = "outIP")]
    pub out_ip: String,
    #[serde(rename = "outPort", default)]
    pub out_port: Option<u16>,
    #[serde(rename = "inIp")]
    pub in_ip: String,
    #[serde(rename = "inPort", default)]
    pub in_port: Option<u16>,
    #[serde(rename = "inSize", default)]
    pub in_size: Sizes,
    #[serde(rename = "outSize", default)]
    pub out_size: Sizes,
}

/// Directional pair key: `"{source}_{destination}"`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey(String);

impl PairKey {
    pub fn new(source: &str, destination: &str) -> Self {
        Self(format!("{}_{}", source, destination))
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Progress of hop discovery for one flow
#[derive(Debug, Clone, PartialEq)]
pub enum TraceStatus {
    /// Flow does not cross the network boundary
    NotRequired,
    Running,
    /// Process exited; `hops` lines were accepted (possibly zero)
    Completed { hops: usize },
    Failed { reason: String },
}

impl TraceStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, TraceStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::NotRequired => "not-required",
            TraceStatus::Running => "running",
            TraceStatus::Completed { .. } => "completed",
            TraceStatus::Failed { .. } => "failed",
        }
    }
}

/// Flow enriched with classification, geolocated endpoints and hop path
pub struct AugmentedFlow {
    out_ip: Arc<ResolvedIp>,
    out_port: Option<u16>,
    in_ip: Arc<ResolvedIp>,
    in_port: Option<u16>,
    in_size: Sizes,
    out_size: Sizes,
    is_internal: bool,
    routes: Mutex<Vec<Arc<ResolvedIp>>>,
    trace: watch::Sender<TraceStatus>,
}

impl AugmentedFlow {
    pub fn new(
        record: &FlowRecord,
        out_ip: Arc<ResolvedIp>,
        in_ip: Arc<ResolvedIp>,
        is_internal: bool,
        trace: TraceStatus,
    ) -> Self {
        let (trace, _) = watch::channel(trace);
        Self {
            out_ip,
            out_port: record.out_port,
            in_ip,
            in_port: record.in_port,
            in_size: record.in_size,
            out_size: record.out_size,
            is_internal,
            routes: Mutex::new(Vec::new()),
            trace,
        }
    }

    pub fn out_ip(&self) -> &Arc<ResolvedIp> {
        &self.out_ip
    }

    pub fn in_ip(&self) -> &Arc<ResolvedIp> {
        &self.in_ip
    }

    pub fn is_internal(&self) -> bool {
        self.is_internal
    }

    /// Hops discovered so far, in emission order
    pub fn routes(&self) -> Vec<Arc<ResolvedIp>> {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn route_addresses(&self) -> Vec<String> {
        self.routes()
            .iter()
            .map(|hop| hop.address().to_string())
            .collect()
    }

    /// Append a hop; the list is never reordered
    pub fn push_route(&self, hop: Arc<ResolvedIp>) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hop);
    }

    pub fn trace_status(&self) -> TraceStatus {
        self.trace.borrow().clone()
    }

    pub fn set_trace_status(&self, status: TraceStatus) {
        self.trace.send_replace(status);
    }

    /// Wait until hop discovery has finished (returns at once if none runs)
    pub async fn wait_for_trace(&self) -> TraceStatus {
        let mut rx = self.trace.subscribe();
        let status = match rx.wait_for(TraceStatus::is_finished).await {
            Ok(status) => status.clone(),
            Err(_) => self.trace_status(),
        };
        status
    }

    /// Point-in-time copy oriented to `record`
    ///
    /// A flow is shared by both directions of a pair; when `record` is the
    /// reverse direction, endpoints, ports and sizes are swapped so `outIP`
    /// always matches the message being answered. Routes are shared as-is.
    pub fn snapshot_for(&self, record: &FlowRecord) -> AugmentedSnapshot {
        let mut snapshot = self.snapshot();
        let reversed = record.out_ip != self.out_ip.address()
            && record.out_ip == self.in_ip.address();

        if reversed {
            std::mem::swap(&mut snapshot.out_ip, &mut snapshot.in_ip);
            std::mem::swap(&mut snapshot.out_port, &mut snapshot.in_port);
            std::mem::swap(&mut snapshot.out_size, &mut snapshot.in_size);
        }
        snapshot
    }

    /// Point-in-time copy for publishing
    pub fn snapshot(&self) -> AugmentedSnapshot {
        AugmentedSnapshot {
            out_ip: self.out_ip.snapshot(),
            out_port: self.out_port,
            in_ip: self.in_ip.snapshot(),
            in_port: self.in_port,
            in_size: self.in_size,
            out_size: self.out_size,
            is_internal: self.is_internal,
            routes: self.routes().iter().map(|hop| hop.snapshot()).collect(),
            trace_status: self.trace_status().as_str().to_string(),
        }
    }
}

impl fmt::Debug for AugmentedFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AugmentedFlow")
            .field("out_ip", &self.out_ip.address())
            .field("in_ip", &self.in_ip.address())
            .field("is_internal", &self.is_internal)
            .field("routes", &self.route_addresses())
            .field("trace", &self.trace_status())
            .finish()
    }
}

/// Wire form of an augmented flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentedSnapshot {
    #[serde(rename = "outIP")]
    pub out_ip: IpSnapshot,
    #[serde(rename = "outPort")]
    pub out_port: Option<u16>,
    #[serde(rename = "inIp")]
    pub in_ip: IpSnapshot,
    #[serde(rename = "inPort")]
    pub in_port: Option<u16>,
    #[serde(rename = "inSize")]
    pub in_size: Sizes,
    #[serde(rename = "outSize")]
    pub out_size: Sizes,
    #[serde(rename = "isInternal")]
    pub is_internal: bool,
    pub routes: Vec<IpSnapshot>,
    #[serde(rename = "traceStatus")]
    pub trace_status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> FlowRecord {
        serde_json::from_str(
            r#"{
                "outIP": "192.168.1.1",
                "outPort": 80,
                "inIp": "8.8.8.8",
                "inPort": 443,
                "inSize": {"last2Seconds": 1, "last10Seconds": 5, "last40Seconds": 20, "cumulative": 100},
                "outSize": {"last2Seconds": 2, "last10Seconds": 6, "last40Seconds": 21, "cumulative": 101}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_flow_record_field_names() {
        let record = record();
        assert_eq!(record.out_ip, "192.168.1.1");
        assert_eq!(record.out_port, Some(80));
        assert_eq!(record.in_port, Some(443));
        assert_eq!(record.in_size.last_40_seconds, 20.0);
        assert_eq!(record.out_size.cumulative, 101.0);
    }

    #[test]
    fn test_missing_ports_and_sizes() {
        let record: FlowRecord =
            serde_json::from_str(r#"{"outIP": "10.0.0.1", "inIp": "10.0.0.2", "outPort": null}"#)
                .unwrap();
        assert_eq!(record.out_port, None);
        assert_eq!(record.in_size, Sizes::default());
    }

    #[test]
    fn test_pair_key_is_directional() {
        assert_eq!(PairKey::new("a", "b").to_string(), "a_b");
        assert_ne!(PairKey::new("a", "b"), PairKey::new("b", "a"));
    }

    #[tokio::test]
    async fn test_routes_grow_and_trace_completes() {
        let flow = Arc::new(AugmentedFlow::new(
            &record(),
            Arc::new(ResolvedIp::pending("192.168.1.1")),
            Arc::new(ResolvedIp::pending("8.8.8.8")),
            false,
            TraceStatus::Running,
        ));

        let waiter = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.wait_for_trace().await })
        };

        flow.push_route(Arc::new(ResolvedIp::pending("10.0.0.1")));
        flow.push_route(Arc::new(ResolvedIp::pending("72.14.0.1")));
        flow.set_trace_status(TraceStatus::Completed { hops: 2 });

        assert_eq!(waiter.await.unwrap(), TraceStatus::Completed { hops: 2 });
        assert_eq!(flow.route_addresses(), vec!["10.0.0.1", "72.14.0.1"]);
    }

    #[test]
    fn test_snapshot_for_reverse_direction() {
        let flow = AugmentedFlow::new(
            &record(),
            Arc::new(ResolvedIp::pending("192.168.1.1")),
            Arc::new(ResolvedIp::pending("8.8.8.8")),
            false,
            TraceStatus::Running,
        );
        flow.push_route(Arc::new(ResolvedIp::pending("10.0.0.1")));

        let same = flow.snapshot_for(&record());
        assert_eq!(same, flow.snapshot());

        let reverse: FlowRecord = serde_json::from_str(
            r#"{"outIP": "8.8.8.8", "outPort": 443, "inIp": "192.168.1.1", "inPort": 80}"#,
        )
        .unwrap();
        let snapshot = flow.snapshot_for(&reverse);
        assert_eq!(snapshot.out_ip.address, "8.8.8.8");
        assert_eq!(snapshot.out_port, Some(443));
        assert_eq!(snapshot.in_ip.address, "192.168.1.1");
        assert_eq!(snapshot.in_port, Some(80));
        assert_eq!(snapshot.out_size.cumulative, 100.0);
        assert_eq!(snapshot.routes, same.routes);
    }

    #[test]
    fn test_snapshot_wire_format() {
        let flow = AugmentedFlow::new(
            &record(),
            Arc::new(ResolvedIp::pending("192.168.1.1")),
            Arc::new(ResolvedIp::pending("8.8.8.8")),
            false,
            TraceStatus::NotRequired,
        );

        let json = serde_json::to_value(flow.snapshot()).unwrap();
        assert_eq!(json["outIP"]["address"], "192.168.1.1");
        assert_eq!(json["inIp"]["address"], "8.8.8.8");
        assert_eq!(json["isInternal"], false);
        assert_eq!(json["routes"], serde_json::json!([]));
        assert_eq!(json["traceStatus"], "not-required");
        assert_eq!(json["inSize"]["last10Seconds"], 5.0);
    }
}
