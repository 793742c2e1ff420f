//! Hop discovery between two endpoints
//!
//! [`HopTracer`] runs the configured tool (`traceroute -n <destination>` by
//! default) in the background and appends every accepted hop to the target
//! flow as soon as its line is printed. Callers never block on a trace; they
//! observe progress through [`AugmentedFlow::routes`] and completion through
//! [`AugmentedFlow::wait_for_trace`].

mod parser;

pub use parser::{Hop, HopLineParser};

use crate::error::Result;
use crate::flow::{AugmentedFlow, TraceStatus};
use crate::geo::GeoResolver;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};

/// Something that can discover the hops between two addresses
pub trait HopDiscovery: Send + Sync {
    /// Start discovering hops from `from` to `to`, filling `target.routes`
    ///
    /// Returns immediately; progress is reported on `target`.
    fn trace(&self, from: &str, to: &str, target: Arc<AugmentedFlow>);
}

/// Subprocess-backed hop discovery
pub struct HopTracer {
    command: String,
    flags: Vec<String>,
    timeout: Option<Duration>,
    parser: HopLineParser,
    resolver: Arc<GeoResolver>,
}

impl HopTracer {
    pub fn new(
        command: impl Into<String>,
        flags: Vec<String>,
        timeout: Option<Duration>,
        resolver: Arc<GeoResolver>,
    ) -> Result<Self> {
        Ok(Self {
            command: command.into(),
            flags,
            timeout,
            parser: HopLineParser::new()?,
            resolver,
        })
    }
}

impl HopDiscovery for HopTracer {
    fn trace(&self, from: &str, to: &str, target: Arc<AugmentedFlow>) {
        let mut command = Command::new(&self.command);
        command
            .args(&self.flags)
            .arg(to)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("Failed to start {} for {}: {}", self.command, to, e);
                target.set_trace_status(TraceStatus::Failed {
                    reason: format!("failed to start {}: {}", self.command, e),
                });
                return;
            }
        };

        tracing::info!("Tracing hops from {} to {}", from, to);

        tokio::spawn(run_trace(
            child,
            self.parser.clone(),
            self.resolver.clone(),
            target,
            self.timeout,
            to.to_string(),
        ));
    }
}

async fn run_trace(
    mut child: Child,
    parser: HopLineParser,
    resolver: Arc<GeoResolver>,
    target: Arc<AugmentedFlow>,
    timeout: Option<Duration>,
    destination: String,
) {
    if let Some(stderr) = child.stderr.take() {
        let destination = destination.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!("Trace to {} stderr: {}", destination, line);
            }
        });
    }

    let collect = collect_hops(child.stdout.take(), &parser, &resolver, &target);
    let hops = match timeout {
        Some(limit) => tokio::time::timeout(limit, collect).await.ok(),
        None => Some(collect.await),
    };

    let status = match hops {
        Some(hops) => match child.wait().await {
            Ok(exit) if !exit.success() && hops == 0 => TraceStatus::Failed {
                reason: format!("exited with {}", exit),
            },
            Ok(_) => TraceStatus::Completed { hops },
            Err(e) => TraceStatus::Failed {
                reason: format!("failed to wait for trace process: {}", e),
            },
        },
        None => {
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill trace to {}: {}", destination, e);
            }
            TraceStatus::Failed {
                reason: "timed out".to_string(),
            }
        }
    };

    match &status {
        TraceStatus::Completed { hops } => {
            tracing::info!("Trace to {} finished with {} hops", destination, hops)
        }
        TraceStatus::Failed { reason } => {
            tracing::warn!("Trace to {} failed: {}", destination, reason)
        }
        _ => {}
    }

    target.set_trace_status(status);
}

/// Read stdout to the end, appending each hop; returns the number accepted
async fn collect_hops(
    stdout: Option<ChildStdout>,
    parser: &HopLineParser,
    resolver: &GeoResolver,
    target: &AugmentedFlow,
) -> usize {
    let Some(stdout) = stdout else {
        return 0;
    };

    let mut lines = BufReader::new(stdout).lines();
    let mut hops = 0;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parser.parse(&line) {
                Some(hop) => {
                    tracing::debug!("Hop {}: {}", hop.index, hop.address);
                    target.push_route(resolver.resolve(&hop.address));
                    hops += 1;
                }
                None => tracing::trace!("Skipping trace line: {}", line),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Failed to read trace output: {}", e);
                break;
            }
        }
    }

    hops
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowRecord, Sizes};
    use crate::geo::testing::MemoryStore;
    use crate::geo::{NoLookup, ResolvedIp};

    fn resolver() -> Arc<GeoResolver> {
        Arc::new(GeoResolver::new(
            Arc::new(MemoryStore::default()),
            Arc::new(NoLookup),
        ))
    }

    fn target() -> Arc<AugmentedFlow> {
        let record = FlowRecord {
            out_ip: "192.168.1.1".to_string(),
            out_port: None,
            in_ip: "8.8.8.8".to_string(),
            in_port: None,
            in_size: Sizes::default(),
            out_size: Sizes::default(),
        };
        Arc::new(AugmentedFlow::new(
            &record,
            Arc::new(ResolvedIp::pending("192.168.1.1")),
            Arc::new(ResolvedIp::pending("8.8.8.8")),
            false,
            TraceStatus::Running,
        ))
    }

    /// `sh -c <script> hop <destination>`: the script sees the destination as $1
    fn script_tracer(script: &str, resolver: Arc<GeoResolver>) -> HopTracer {
        HopTracer::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "hop".to_string()],
            Some(Duration::from_secs(5)),
            resolver,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_trace_appends_hops_in_order() {
        let resolver = resolver();
        let tracer = script_tracer(
            r#"echo "traceroute to $1, 30 hops max"
echo " 1  192.168.1.254  0.512 ms  0.470 ms  0.455 ms"
echo " 2  * * *"
echo " 3  100.64.0.1  4.1 ms  4.0 ms"
echo " 4  72.14.215.85  12.4 ms  11.9 ms  12.0 ms"
echo " 2  10.10.10.10  3.0 ms  3.1 ms  3.2 ms"
echo " 5  $1  20.1 ms  20.3 ms  19.8 ms""#,
            resolver.clone(),
        );
        let flow = target();

        tracer.trace("192.168.1.1", "8.8.8.8", flow.clone());
        let status = flow.wait_for_trace().await;

        assert_eq!(status, TraceStatus::Completed { hops: 4 });
        assert_eq!(
            flow.route_addresses(),
            vec!["192.168.1.254", "72.14.215.85", "10.10.10.10", "8.8.8.8"]
        );
        // Hop addresses go through the shared resolver cache
        assert!(Arc::ptr_eq(
            &flow.routes()[3],
            &resolver.resolve("8.8.8.8")
        ));
    }

    #[tokio::test]
    async fn test_stderr_does_not_abort_trace() {
        let tracer = script_tracer(
            r#"echo "warning: something odd" >&2
echo " 1  10.0.0.1  1.0 ms  1.0 ms  1.0 ms""#,
            resolver(),
        );
        let flow = target();

        tracer.trace("192.168.1.1", "8.8.8.8", flow.clone());

        assert_eq!(
            flow.wait_for_trace().await,
            TraceStatus::Completed { hops: 1 }
        );
        assert_eq!(flow.route_addresses(), vec!["10.0.0.1"]);
    }

    #[tokio::test]
    async fn test_empty_output_is_terminal() {
        let tracer = script_tracer("echo 'no route'", resolver());
        let flow = target();

        tracer.trace("192.168.1.1", "8.8.8.8", flow.clone());

        assert_eq!(
            flow.wait_for_trace().await,
            TraceStatus::Completed { hops: 0 }
        );
        assert!(flow.routes().is_empty());
    }

    #[tokio::test]
    async fn test_failing_command_without_hops() {
        let tracer = script_tracer("echo 'unknown host' >&2; exit 2", resolver());
        let flow = target();

        tracer.trace("192.168.1.1", "8.8.8.8", flow.clone());

        assert!(matches!(
            flow.wait_for_trace().await,
            TraceStatus::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_command_fails_immediately() {
        let tracer = HopTracer::new(
            "/nonexistent/hopscope-traceroute",
            vec![],
            None,
            resolver(),
        )
        .unwrap();
        let flow = target();

        tracer.trace("192.168.1.1", "8.8.8.8", flow.clone());

        assert!(matches!(flow.trace_status(), TraceStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_trace() {
        let tracer = HopTracer::new(
            "sh",
            vec![
                "-c".to_string(),
                "echo ' 1  10.0.0.1  1.0  1.0  1.0'; sleep 10".to_string(),
                "hop".to_string(),
            ],
            Some(Duration::from_millis(300)),
            resolver(),
        )
        .unwrap();
        let flow = target();

        tracer.trace("192.168.1.1", "8.8.8.8", flow.clone());

        assert_eq!(
            flow.wait_for_trace().await,
            TraceStatus::Failed {
                reason: "timed out".to_string()
            }
        );
        assert_eq!(flow.route_addresses(), vec!["10.0.0.1"]);
    }
}
