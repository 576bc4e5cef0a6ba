use crate::error::Error;
use crate::id;
use std::net::SocketAddr;
use std::time::Duration;

/// Default port range for the interchange's worker-facing sockets.
pub const DEFAULT_WORKER_PORT_RANGE: (u16, u16) = (54000, 55000);

/// Default port range for the client-facing sockets.
pub const DEFAULT_INTERCHANGE_PORT_RANGE: (u16, u16) = (55000, 56000);

/// Default template used to launch one fabric per provider block.
pub const DEFAULT_LAUNCH_CMD: &str =
    "fabric {debug} -w {tasks_per_node} --task_url={task_url} --result_url={result_url} \
     --heartbeat_period={heartbeat_period}";

const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);
const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration of the client-side executor.
#[derive(Debug, Clone)]
pub struct HtexConfig {
    /// Label for this executor instance, used in scaling errors.
    pub label: String,
    /// Address workers use to reach the interchange from other nodes.
    pub public_ip: String,
    /// Fixed worker-facing ports; overrides `worker_port_range` when set.
    pub worker_ports: Option<(u16, u16)>,
    pub worker_port_range: (u16, u16),
    pub interchange_port_range: (u16, u16),
    /// Launch command template; see [`substitute_launch_cmd`].
    pub launch_cmd: String,
    pub storage_access: Vec<String>,
    pub working_dir: Option<String>,
    /// Passes `--debug` to launched fabrics.
    pub engine_debug: bool,
    pub heartbeat_period: Duration,
    /// Window the interchange has to report its worker-facing ports.
    pub init_timeout: Duration,
}

impl Default for HtexConfig {
    fn default() -> Self {
        Self {
            label: "HighThroughputExecutor".to_string(),
            public_ip: "127.0.0.1".to_string(),
            worker_ports: None,
            worker_port_range: DEFAULT_WORKER_PORT_RANGE,
            interchange_port_range: DEFAULT_INTERCHANGE_PORT_RANGE,
            launch_cmd: DEFAULT_LAUNCH_CMD.to_string(),
            storage_access: Vec::new(),
            working_dir: None,
            engine_debug: false,
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }
}

impl HtexConfig {
    /// Checks constructor-time invariants.
    pub fn validate(&self) -> Result<(), Error> {
        if self.storage_access.len() > 1 {
            return Err(Error::Configuration(
                "multiple storage access schemes are not supported".to_string(),
            ));
        }
        let (lo, hi) = self.interchange_port_range;
        if lo >= hi {
            return Err(Error::Configuration(format!(
                "invalid interchange port range [{}, {}]",
                lo, hi
            )));
        }
        Ok(())
    }
}

/// Configuration of one fabric (a coordinator plus its local workers).
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Interchange url tasks are pulled from, e.g. `tcp://10.0.0.1:54001`.
    pub task_url: String,
    /// Interchange url results are pushed to.
    pub result_url: String,
    /// Number of worker slots on this node.
    pub workers: usize,
    /// Pending-task queue capacity; 0 means "as many as there are workers".
    pub max_queue_size: usize,
    pub heartbeat_period: Duration,
    pub uid: String,
}

impl FabricConfig {
    pub fn new(
        task_url: impl Into<String>,
        result_url: impl Into<String>,
        workers: usize,
        heartbeat_period: Duration,
    ) -> Self {
        Self {
            task_url: task_url.into(),
            result_url: result_url.into(),
            workers,
            max_queue_size: 0,
            heartbeat_period,
            uid: id::short_uid(),
        }
    }

    /// Effective pending-task queue capacity.
    pub fn queue_capacity(&self) -> usize {
        if self.max_queue_size == 0 {
            self.workers
        } else {
            self.max_queue_size.max(self.workers)
        }
    }
}

/// Formats a `tcp://<ip>:<port>` url.
pub fn tcp_url(ip: &str, port: u16) -> String {
    format!("tcp://{}:{}", ip, port)
}

/// Parses a `tcp://<ip>:<port>` url into a socket address.
pub fn parse_tcp_url(url: &str) -> Result<SocketAddr, Error> {
    let rest = url
        .strip_prefix("tcp://")
        .ok_or_else(|| Error::Configuration(format!("url {:?} is not tcp://", url)))?;
    rest.parse()
        .map_err(|e| Error::Configuration(format!("invalid address in url {:?}: {}", url, e)))
}

/// Substitutes the launch-command tokens: `{debug}`, `{task_url}`,
/// `{result_url}`, `{tasks_per_node}`, `{nodes_per_block}` and
/// `{heartbeat_period}` (whole seconds).
///
/// The heartbeat period has to reach launched fabrics: their heartbeat
/// cadence is derived from it, and the interchange's liveness deadline is
/// the same period on the other side.
pub fn substitute_launch_cmd(
    template: &str,
    debug: bool,
    task_url: &str,
    result_url: &str,
    tasks_per_node: usize,
    nodes_per_block: usize,
    heartbeat_period: Duration,
) -> String {
    template
        .replace("{debug}", if debug { "--debug" } else { "" })
        .replace("{task_url}", task_url)
        .replace("{result_url}", result_url)
        .replace("{tasks_per_node}", &tasks_per_node.to_string())
        .replace("{nodes_per_block}", &nodes_per_block.to_string())
        .replace("{heartbeat_period}", &heartbeat_period.as_secs().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(HtexConfig::default().validate().is_ok());
    }

    #[test]
    fn multiple_storage_access_entries_are_rejected() {
        let mut config = HtexConfig::default();
        config.storage_access = vec!["a".to_string(), "b".to_string()];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn tcp_url_round_trips() {
        let url = tcp_url("127.0.0.1", 54321);
        assert_eq!(url, "tcp://127.0.0.1:54321");
        let addr = parse_tcp_url(&url).expect("url should parse");
        assert_eq!(addr.port(), 54321);
    }

    #[test]
    fn non_tcp_urls_are_rejected() {
        assert!(parse_tcp_url("ipc:///tmp/sock").is_err());
        assert!(parse_tcp_url("tcp://no-port").is_err());
    }

    #[test]
    fn queue_capacity_defaults_to_worker_count() {
        let config = FabricConfig::new(
            "tcp://127.0.0.1:1",
            "tcp://127.0.0.1:2",
            8,
            Duration::from_secs(30),
        );
        assert_eq!(config.queue_capacity(), 8);

        let mut config = config;
        config.max_queue_size = 3;
        // never smaller than the worker count
        assert_eq!(config.queue_capacity(), 8);
        config.max_queue_size = 100;
        assert_eq!(config.queue_capacity(), 100);
    }

    #[test]
    fn launch_cmd_substitution() {
        let cmd = substitute_launch_cmd(
            DEFAULT_LAUNCH_CMD,
            true,
            "tcp://10.0.0.1:54001",
            "tcp://10.0.0.1:54002",
            4,
            1,
            Duration::from_secs(7),
        );
        assert_eq!(
            cmd,
            "fabric --debug -w 4 --task_url=tcp://10.0.0.1:54001 \
             --result_url=tcp://10.0.0.1:54002 --heartbeat_period=7"
        );
    }
}
