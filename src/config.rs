use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub mailbox_capacity: usize,
    pub history_capacity: usize,
    /// Budget a `send` waits for space in a full mailbox.
    pub send_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
            history_capacity: 1000,
            send_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_concurrent_tasks: usize,
    pub tick_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            tick_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// A worker whose last recorded heartbeat is older than twice this
    /// interval is demoted to error.
    pub heartbeat_interval: Duration,
    pub health_check_interval: Duration,
    /// Grace period given to a worker after a graceful shutdown message.
    pub shutdown_grace: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub bus: BusConfig,
    pub coordinator: CoordinatorConfig,
    pub lifecycle: LifecycleConfig,
}
