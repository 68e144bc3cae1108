//! Mock driver and factory for tests
//!
//! No browser involved: drivers are inert value objects, the factory counts
//! creations, records the proxies it was asked to use, and can be told to
//! fail. Used by the pool/worker unit tests and the end-to-end scenarios.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{Driver, DriverFactory, DriverOptions};
use crate::types::{DroverError, Result};

#[derive(Default)]
pub struct MockDriver {
    pids: Vec<u32>,
    quit_called: AtomicBool,
    navigations: Mutex<Vec<String>>,
}

impl MockDriver {
    pub fn with_pids(pids: Vec<u32>) -> Self {
        Self {
            pids,
            ..Self::default()
        }
    }

    pub fn quit_was_called(&self) -> bool {
        self.quit_called.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().unwrap().clone()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        self.navigations.lock().unwrap().push(url.to_string());
        Ok(())
    }

    async fn execute_script(
        &mut self,
        _source: &str,
        _args: &[serde_json::Value],
    ) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    async fn current_url(&mut self) -> Result<String> {
        Ok(self
            .navigations
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn title(&mut self) -> Result<String> {
        Ok("mock".to_string())
    }

    async fn find_elements(&mut self, _selector: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn quit(&mut self) -> Result<()> {
        self.quit_called.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pids(&self) -> Vec<u32> {
        self.pids.clone()
    }
}

#[derive(Debug, Clone, Copy)]
enum FailMode {
    Never,
    Always,
    FirstN(u32),
}

pub struct MockFactory {
    fail_mode: FailMode,
    attempts: AtomicU32,
    created: AtomicUsize,
    proxy_support: bool,
    proxies_seen: Mutex<Vec<String>>,
}

impl Default for MockFactory {
    fn default() -> Self {
        Self {
            fail_mode: FailMode::Never,
            attempts: AtomicU32::new(0),
            created: AtomicUsize::new(0),
            proxy_support: false,
            proxies_seen: Mutex::new(Vec::new()),
        }
    }
}

impl MockFactory {
    /// Every creation attempt fails.
    pub fn failing() -> Self {
        Self {
            fail_mode: FailMode::Always,
            ..Self::default()
        }
    }

    /// The first `n` creation attempts fail, the rest succeed.
    pub fn failing_first(n: u32) -> Self {
        Self {
            fail_mode: FailMode::FirstN(n),
            ..Self::default()
        }
    }

    pub fn with_proxy_support() -> Self {
        Self {
            proxy_support: true,
            ..Self::default()
        }
    }

    /// Successful creations so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Creation attempts, failures included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Proxy URLs seen by successful creations, in order.
    pub fn proxies_seen(&self) -> Vec<String> {
        self.proxies_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl DriverFactory for MockFactory {
    async fn create(&self, options: &DriverOptions) -> Result<Box<dyn Driver>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let fail = match self.fail_mode {
            FailMode::Never => false,
            FailMode::Always => true,
            FailMode::FirstN(n) => attempt <= n,
        };
        if fail {
            return Err(DroverError::Driver(format!(
                "mock factory refused creation (attempt {attempt})"
            )));
        }

        if let Some(proxy) = &options.proxy {
            self.proxies_seen.lock().unwrap().push(proxy.format_url());
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockDriver::default()))
    }

    fn supports_proxy(&self) -> bool {
        self.proxy_support
    }
}
