//! Bounded headless-browser pool with dynamic scaling (C6).
//!
//! Adapted directly from the pool's `PooledBrowserWrapper`/`PooledBrowser`/
//! `BrowserPool`/`PooledBrowserGuard` RAII structure and its
//! `target = max(in_use + 2, min_pool_size).min(max_pool_size)` scaling
//! formula. The one structural addition is debug-port management: each
//! pooled browser is launched with an explicit `--remote-debugging-port` so
//! the external analyzer subprocess has a fixed endpoint to attach to, and
//! released ports are reused from a free-list before a new one is minted.

use anyhow::{Context, Result};
use chromiumoxide::browser::Browser;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BASE_DEBUG_PORT: u16 = 9222;

#[derive(Debug, Clone)]
pub struct BrowserPoolConfig {
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub keepalive_interval: Duration,
    pub idle_timeout: Duration,
    pub launch_timeout: Duration,
    pub headless: bool,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: 2,
            max_pool_size: 10,
            keepalive_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            launch_timeout: Duration::from_secs(30),
            headless: true,
        }
    }
}

/// RAII wrapper around a launched browser plus its background CDP handler
/// task and temp profile directory. Dropping it aborts the handler and
/// cleans up the directory.
#[derive(Debug)]
pub struct PooledBrowserWrapper {
    browser: Arc<Browser>,
    handler: JoinHandle<()>,
    user_data_dir: Option<PathBuf>,
    debug_port: u16,
}

impl PooledBrowserWrapper {
    fn new(browser: Browser, handler: JoinHandle<()>, user_data_dir: PathBuf, debug_port: u16) -> Self {
        Self {
            browser: Arc::new(browser),
            handler,
            user_data_dir: Some(user_data_dir),
            debug_port,
        }
    }

    pub fn browser(&self) -> &Browser {
        &self.browser
    }

    pub fn browser_arc(&self) -> Arc<Browser> {
        Arc::clone(&self.browser)
    }

    pub fn browser_mut(&mut self) -> Option<&mut Browser> {
        Arc::get_mut(&mut self.browser)
    }

    pub fn debug_port(&self) -> u16 {
        self.debug_port
    }

    fn cleanup_temp_dir(&mut self) {
        if let Some(path) = self.user_data_dir.take() {
            info!("cleaning up pool browser temp directory: {}", path.display());
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!("failed to clean up temp directory {}: {}", path.display(), e);
            }
        }
    }
}

impl Drop for PooledBrowserWrapper {
    fn drop(&mut self) {
        self.handler.abort();
        if self.user_data_dir.is_some() {
            self.cleanup_temp_dir();
        }
    }
}

#[derive(Debug)]
pub struct PooledBrowser {
    pub id: u64,
    pub wrapper: PooledBrowserWrapper,
    pub created_at: Instant,
    pub last_used: Instant,
    pub last_health_check: Instant,
}

impl PooledBrowser {
    fn new(id: u64, wrapper: PooledBrowserWrapper) -> Self {
        let now = Instant::now();
        Self {
            id,
            wrapper,
            created_at: now,
            last_used: now,
            last_health_check: now,
        }
    }
}

/// Tracks debug ports that were in use and have since been released, so a
/// restarted or newly scaled-up browser can reuse one instead of the pool's
/// port range growing without bound across its lifetime.
#[derive(Default)]
struct PortAllocator {
    next_port: AtomicU16,
    free_list: Mutex<Vec<u16>>,
}

impl PortAllocator {
    fn new() -> Self {
        Self {
            next_port: AtomicU16::new(BASE_DEBUG_PORT),
            free_list: Mutex::new(Vec::new()),
        }
    }

    async fn acquire(&self) -> u16 {
        if let Some(port) = self.free_list.lock().await.pop() {
            return port;
        }
        self.next_port.fetch_add(1, Ordering::Relaxed)
    }

    async fn release(&self, port: u16) {
        self.free_list.lock().await.push(port);
    }
}

#[derive(Debug)]
pub struct BrowserPool {
    config: BrowserPoolConfig,
    available: Arc<Mutex<VecDeque<PooledBrowser>>>,
    in_use_count: AtomicUsize,
    next_id: AtomicU64,
    scaler_handle: Mutex<Option<JoinHandle<()>>>,
    keepalive_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
    ports: PortAllocator,
}

impl BrowserPool {
    pub fn new(config: BrowserPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            available: Arc::new(Mutex::new(VecDeque::new())),
            in_use_count: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            scaler_handle: Mutex::new(None),
            keepalive_handle: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            ports: PortAllocator::new(),
        })
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!("starting browser pool with config: {:?}", self.config);

        self.scale_to_target().await?;

        let pool_clone = Arc::clone(self);
        let scaler = tokio::spawn(async move {
            scaler_loop(pool_clone).await;
        });
        *self.scaler_handle.lock().await = Some(scaler);

        let pool_clone = Arc::clone(self);
        let keepalive = tokio::spawn(async move {
            keepalive_loop(pool_clone).await;
        });
        *self.keepalive_handle.lock().await = Some(keepalive);

        info!(
            "browser pool started with {} pre-warmed browsers",
            self.available.lock().await.len()
        );
        Ok(())
    }

    pub async fn acquire(self: &Arc<Self>) -> Result<PooledBrowserGuard> {
        loop {
            let mut available = self.available.lock().await;

            if let Some(mut browser) = available.pop_front() {
                match browser.wrapper.browser().version().await {
                    Ok(_) => {
                        browser.last_used = Instant::now();
                        browser.last_health_check = Instant::now();
                        self.in_use_count.fetch_add(1, Ordering::Relaxed);
                        debug!("acquired browser {} from pool", browser.id);

                        return Ok(PooledBrowserGuard {
                            browser: Some(browser),
                            pool: Arc::clone(self),
                        });
                    }
                    Err(e) => {
                        warn!("browser {} failed health check during acquire: {}", browser.id, e);
                        continue;
                    }
                }
            }

            drop(available);

            let total = self.in_use_count.load(Ordering::Relaxed) + self.available.lock().await.len();

            if total < self.config.max_pool_size {
                let browser = self.launch_browser_internal().await?;
                self.in_use_count.fetch_add(1, Ordering::Relaxed);
                debug!("launched new browser {} for acquire (pool was empty)", browser.id);

                return Ok(PooledBrowserGuard {
                    browser: Some(browser),
                    pool: Arc::clone(self),
                });
            }

            warn!("browser pool at max capacity ({}), waiting...", self.config.max_pool_size);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn release(self: &Arc<Self>, mut browser: PooledBrowser) {
        self.in_use_count.fetch_sub(1, Ordering::Relaxed);
        browser.last_used = Instant::now();

        let available = Arc::clone(&self.available);
        let id = browser.id;

        tokio::spawn(async move {
            available.lock().await.push_back(browser);
            debug!("released browser {} back to pool", id);
        });
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down browser pool");
        self.shutdown.store(true, Ordering::Relaxed);

        if let Some(handle) = self.scaler_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.keepalive_handle.lock().await.take() {
            handle.abort();
        }

        let mut available = self.available.lock().await;
        while let Some(mut browser) = available.pop_front() {
            let port = browser.wrapper.debug_port();
            if let Some(b) = browser.wrapper.browser_mut() {
                if let Err(e) = b.close().await {
                    warn!("failed to close browser {}: {}", browser.id, e);
                }
                let _ = b.wait().await;
            } else {
                warn!("browser {} has outstanding references, skipping graceful close", browser.id);
            }
            browser.wrapper.cleanup_temp_dir();
            self.ports.release(port).await;
        }

        info!("browser pool shutdown complete");
        Ok(())
    }

    fn target_pool_size(&self) -> usize {
        let in_use = self.in_use_count.load(Ordering::Relaxed);
        (in_use + 2).max(self.config.min_pool_size).min(self.config.max_pool_size)
    }

    async fn scale_to_target(&self) -> Result<()> {
        let target = self.target_pool_size();
        let current = self.available.lock().await.len();

        if current >= target {
            return Ok(());
        }

        let to_launch = target - current;
        debug!("scaling pool: launching {} browsers (current={}, target={})", to_launch, current, target);

        let futs: Vec<_> = (0..to_launch).map(|_| self.launch_browser_internal()).collect();
        let results = futures::future::join_all(futs).await;

        let mut available = self.available.lock().await;
        for result in results {
            match result {
                Ok(browser) => available.push_back(browser),
                Err(e) => warn!("failed to launch browser for pool: {}", e),
            }
        }

        Ok(())
    }

    async fn launch_browser_internal(&self) -> Result<PooledBrowser> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let debug_port = self.ports.acquire().await;

        let profile = crate::browser_profile::create_unique_profile_with_prefix("webauditor_chrome_pool")
            .context("failed to create unique pool browser profile")?;
        let user_data_dir = profile.into_path();

        let (browser, handler, _returned_dir) = tokio::time::timeout(
            self.config.launch_timeout,
            crate::browser_setup::launch_browser(self.config.headless, Some(user_data_dir.clone()), debug_port),
        )
        .await
        .map_err(|_| anyhow::anyhow!("browser launch timed out after {:?}", self.config.launch_timeout))?
        .context("failed to launch browser for pool")?;

        let wrapper = PooledBrowserWrapper::new(browser, handler, user_data_dir, debug_port);
        Ok(PooledBrowser::new(id, wrapper))
    }
}

/// RAII guard that returns the browser to the pool on drop.
pub struct PooledBrowserGuard {
    browser: Option<PooledBrowser>,
    pool: Arc<BrowserPool>,
}

impl PooledBrowserGuard {
    pub fn browser(&self) -> &Browser {
        self.browser.as_ref().expect("browser should be present").wrapper.browser()
    }

    pub fn browser_arc(&self) -> Arc<Browser> {
        self.browser.as_ref().expect("browser should be present").wrapper.browser_arc()
    }

    pub fn id(&self) -> u64 {
        self.browser.as_ref().expect("browser should be present").id
    }

    /// The fixed CDP debug port this browser is listening on, for the
    /// external analyzer subprocess to connect to.
    pub fn debug_port(&self) -> u16 {
        self.browser.as_ref().expect("browser should be present").wrapper.debug_port()
    }
}

impl Drop for PooledBrowserGuard {
    fn drop(&mut self) {
        if let Some(browser) = self.browser.take() {
            self.pool.release(browser);
        }
    }
}

async fn scaler_loop(pool: Arc<BrowserPool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));

    while !pool.shutdown.load(Ordering::Relaxed) {
        interval.tick().await;

        if let Err(e) = pool.scale_to_target().await {
            warn!("pool scaler error: {}", e);
        }

        let mut available = pool.available.lock().await;
        let now = Instant::now();
        let min_size = pool.config.min_pool_size;

        while available.len() > min_size {
            if let Some(browser) = available.front() {
                if now.duration_since(browser.last_used) > pool.config.idle_timeout {
                    if let Some(removed) = available.pop_front() {
                        debug!("removing idle browser {} (idle {:?})", removed.id, now.duration_since(removed.last_used));
                        let port = removed.wrapper.debug_port();
                        let allocator_pool = Arc::clone(&pool);
                        tokio::spawn(async move {
                            allocator_pool.ports.release(port).await;
                        });
                    }
                } else {
                    break;
                }
            } else {
                break;
            }
        }
    }

    debug!("scaler loop exiting");
}

async fn keepalive_loop(pool: Arc<BrowserPool>) {
    let mut interval = tokio::time::interval(pool.config.keepalive_interval);

    while !pool.shutdown.load(Ordering::Relaxed) {
        interval.tick().await;

        let mut available = pool.available.lock().await;
        let mut healthy = VecDeque::new();

        while let Some(mut browser) = available.pop_front() {
            match browser.wrapper.browser().version().await {
                Ok(version) => {
                    browser.last_health_check = Instant::now();
                    healthy.push_back(browser);
                    debug!("browser health check OK: {}", version.product);
                }
                Err(e) => {
                    warn!("browser {} failed keepalive health check: {}", browser.id, e);
                }
            }
        }

        *available = healthy;
        debug!("keepalive complete: {} healthy browsers in pool", available.len());
    }

    debug!("keepalive loop exiting");
}
