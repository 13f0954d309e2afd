use crate::config::NodeConfig;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Poll `action` until its result satisfies `predicate` or `timeout` passes.
pub async fn wait_for_result<F, Fut, T, P>(
    mut action: F,
    predicate: P,
    timeout: Duration,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(50);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        sleep(interval).await;
    }
    None
}

/// Wait for a condition with timeout.
pub async fn wait_for<F>(condition: F, timeout: Duration, check_interval: Duration) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(check_interval).await;
    }
    false
}

/// Node settings tuned for localhost clusters: an OS-assigned port and short
/// timeouts so failure detection finishes within a test.
pub fn local_node_config(seeds: Vec<SocketAddr>) -> NodeConfig {
    let bind: SocketAddr = ([127, 0, 0, 1], 0).into();
    NodeConfig::new(bind)
        .with_cluster_name("cachegrid-test")
        .with_seeds(seeds)
        .with_ping_interval(Duration::from_millis(100))
        .with_network_timeout(Duration::from_millis(1500))
        .with_join_timeout(Duration::from_millis(800))
        .with_leave_timeout(Duration::from_secs(5))
}

#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
