//! Driver capability and factory seams
//!
//! The browser protocol is opaque to the runtime core: callers inject a
//! [`DriverFactory`] that produces ready-to-use [`Driver`] handles. The
//! pool only navigates, runs scripts, quits, and tracks child PIDs.

mod proxy;
pub mod testing;
mod user_agents;

pub use proxy::{ProxyEndpoint, ProxyScheme};
pub use user_agents::random_user_agent;

use async_trait::async_trait;
use std::time::Duration;

use crate::config::Config;
use crate::types::Result;

/// Handle to a running browser instance.
#[async_trait]
pub trait Driver: Send {
    async fn navigate(&mut self, url: &str) -> Result<()>;

    async fn execute_script(
        &mut self,
        source: &str,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value>;

    async fn current_url(&mut self) -> Result<String>;

    async fn title(&mut self) -> Result<String>;

    /// Element handles are opaque strings (WebDriver element references).
    async fn find_elements(&mut self, selector: &str) -> Result<Vec<String>>;

    /// Tear the browser session down. Idempotent by contract.
    async fn quit(&mut self) -> Result<()>;

    /// Child process IDs owned by this driver (browser + control process).
    fn pids(&self) -> Vec<u32>;
}

/// Everything a factory needs to launch one browser.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub user_agent: String,
    pub headless: bool,
    /// 0 requests an ephemeral local service port
    pub service_port: u16,
    pub proxy: Option<ProxyEndpoint>,
    /// Page-load deadlines for the driver's own HTTP client
    pub http_request_wait: Duration,
    pub body_load_wait: Duration,
    pub url_load_wait: Duration,
}

impl DriverOptions {
    /// Options for one creation attempt: fresh random user agent, ephemeral
    /// port, timeouts from config. Proxy selection is layered on by the pool.
    pub fn from_config(config: &Config) -> Self {
        let timeouts = &config.misc.timeouts;
        Self {
            user_agent: random_user_agent().to_string(),
            headless: config.system.headless,
            service_port: 0,
            proxy: None,
            http_request_wait: Duration::from_secs_f64(timeouts.max_http_request_wait),
            body_load_wait: Duration::from_secs_f64(timeouts.max_body_load_wait),
            url_load_wait: Duration::from_secs_f64(timeouts.max_url_load_wait),
        }
    }
}

/// Produces ready-to-use drivers.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn create(&self, options: &DriverOptions) -> Result<Box<dyn Driver>>;

    /// Whether this factory can route traffic through a proxy. The pool
    /// refuses to start with proxies enabled against a factory that cannot.
    fn supports_proxy(&self) -> bool {
        false
    }

    /// Executable names of the browser and its control process, matched by
    /// the residual-process sweep in `close_all`.
    fn process_names(&self) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_pick_up_config() {
        let mut config = Config::default();
        config.system.headless = false;
        config.misc.timeouts.max_url_load_wait = 7.0;
        let options = DriverOptions::from_config(&config);
        assert!(!options.headless);
        assert_eq!(options.service_port, 0);
        assert!(options.proxy.is_none());
        assert_eq!(options.url_load_wait, Duration::from_secs(7));
        assert!(!options.user_agent.is_empty());
    }
}
