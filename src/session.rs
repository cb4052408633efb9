use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use url::Url;

use crate::cache::{cache_key, CacheStore, INDEX_KEY};
use crate::extract::{resolve_url, Extractor, RemoteResource, ResourceKind};
use crate::fetch::{Fetcher, HttpTransport, Transport};
use crate::quota::{QuotaSignal, QuotaTracker};
use crate::rewrite::{merge_script, Rewriter, LOCAL_SCHEME, NAV_SCRIPT};

/// Options for one capture session.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Maximum concurrent in-flight fetches per frontier batch.
    pub max_concurrency: usize,
    pub hard_cap_bytes: u64,
    pub soft_threshold_bytes: u64,
    /// Cache entry lifetime. `None` means entries never expire.
    pub ttl: Option<Duration>,
    /// Compress text entries in the cache. Media is always stored raw.
    pub compress: bool,
    /// Maximum link depth from the root. 0 means unlimited; the visited set
    /// alone guarantees termination.
    pub max_depth: usize,
    /// Only recurse into links sharing the root's origin. Leaf resources are
    /// captured from any origin regardless, so pages render offline.
    pub same_origin: bool,
    pub user_agent: String,
    pub timeout: Duration,
    shared_quota: Option<Arc<QuotaTracker>>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            hard_cap_bytes: crate::quota::DEFAULT_HARD_CAP,
            soft_threshold_bytes: crate::quota::DEFAULT_SOFT_THRESHOLD,
            ttl: None,
            compress: true,
            max_depth: 0,
            same_origin: false,
            user_agent: "Pagevault/0.1".to_string(),
            timeout: Duration::from_secs(30),
            shared_quota: None,
        }
    }
}

impl CaptureOptions {
    /// Shares an externally owned quota tracker with this session, so byte
    /// accounting persists across sessions. Without this the session builds
    /// its own tracker from the configured caps.
    pub fn with_quota(mut self, tracker: Arc<QuotaTracker>) -> Self {
        self.shared_quota = Some(tracker);
        self
    }
}

/// Terminal state of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The frontier drained.
    Completed,
    /// The quota hard cap was hit or the session was cancelled before the
    /// frontier drained.
    Aborted,
}

/// Lifecycle of a single resource within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Pending,
    Fetching,
    Cached,
    Failed,
}

/// One resource that could not be captured, in discovery order.
#[derive(Debug, Clone)]
pub struct CaptureFailure {
    pub url: String,
    pub reason: String,
}

/// What the caller gets back from a session: a usable (possibly incomplete)
/// mirror summary plus everything that could not be captured.
#[derive(Debug)]
pub struct CaptureReport {
    pub root_url: Url,
    pub outcome: SessionOutcome,
    pub pages_cached: usize,
    pub resources_cached: usize,
    pub bytes_downloaded: u64,
    pub errors: Vec<CaptureFailure>,
}

/// Requests cancellation of a running session. In-flight fetches drain; no
/// new fetches are dispatched.
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Orchestrates one recursive capture: fetch, extract, rewrite, cache,
/// recurse, with visited-set deduplication and bounded concurrency.
pub struct CaptureSession {
    root: Url,
    options: CaptureOptions,
    fetcher: Arc<Fetcher>,
    store: Arc<CacheStore>,
    extractor: Extractor,
    quota: Arc<QuotaTracker>,
    visited: Arc<Mutex<HashSet<String>>>,
    states: Arc<Mutex<HashMap<String, (ResourceKind, ResourceState)>>>,
    errors: Arc<Mutex<Vec<CaptureFailure>>>,
    cancelled: Arc<AtomicBool>,
}

impl CaptureSession {
    /// Builds a session over the real HTTPS transport, with its cache rooted
    /// at `cache_dir`.
    pub fn new(root_url: &str, cache_dir: &Path, options: CaptureOptions) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&options.user_agent, options.timeout)?);
        let store = Arc::new(CacheStore::open(cache_dir)?);
        Self::with_transport(root_url, store, transport, options)
    }

    /// Builds a session over an arbitrary transport collaborator.
    pub fn with_transport(
        root_url: &str,
        store: Arc<CacheStore>,
        transport: Arc<dyn Transport>,
        options: CaptureOptions,
    ) -> Result<Self> {
        let root = Url::parse(root_url)
            .with_context(|| format!("failed to parse root url: {}", root_url))?;

        let quota = options.shared_quota.clone().unwrap_or_else(|| {
            Arc::new(QuotaTracker::new(
                options.hard_cap_bytes,
                options.soft_threshold_bytes,
            ))
        });

        Ok(Self {
            root,
            fetcher: Arc::new(Fetcher::new(transport, quota.clone())),
            store,
            extractor: Extractor::new()?,
            quota,
            options,
            visited: Arc::new(Mutex::new(HashSet::new())),
            states: Arc::new(Mutex::new(HashMap::new())),
            errors: Arc::new(Mutex::new(Vec::new())),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancelled.clone())
    }

    /// Runs the capture to its terminal state.
    ///
    /// Per-resource failures accumulate in the report and never abort the
    /// session; the root document failing to capture is the one fatal case.
    pub async fn run(&self) -> Result<CaptureReport> {
        let start_bytes = self.quota.bytes_downloaded();

        let progress = ProgressBar::new_spinner();
        progress.set_style(ProgressStyle::default_spinner().template("{spinner} {msg}").unwrap());

        tracing::info!(root = %self.root, "starting capture session");

        let root_key = cache_key(&self.root);
        self.mark_visited(&root_key, ResourceKind::Document);

        progress.set_message(format!("Capturing root: {}", self.root));
        let root_links = self.process_document(self.root.clone(), &progress).await;

        if self.state_of(&root_key) == Some(ResourceState::Failed) {
            progress.finish_and_clear();
            let reason = self
                .errors
                .lock()
                .unwrap()
                .first()
                .map(|f| f.reason.clone())
                .unwrap_or_else(|| "unknown failure".to_string());
            return Err(anyhow!("root document could not be captured: {}", reason));
        }

        let mut frontier: VecDeque<(Url, usize)> = VecDeque::new();
        self.enqueue_links(&mut frontier, root_links, 0);

        let mut outcome = SessionOutcome::Completed;

        while !frontier.is_empty() {
            if self.cancelled.load(Ordering::SeqCst) {
                tracing::info!("capture cancelled; draining stops here");
                outcome = SessionOutcome::Aborted;
                break;
            }

            let batch_size = match self.quota.current_signal() {
                QuotaSignal::Exceeded => {
                    tracing::warn!("hard quota cap reached; aborting capture");
                    outcome = SessionOutcome::Aborted;
                    break;
                }
                // Past the soft threshold fetching continues at reduced
                // fan-out.
                QuotaSignal::SlowDown => (self.options.max_concurrency / 2).max(1),
                QuotaSignal::Ok => self.options.max_concurrency.max(1),
            };

            let mut batch = Vec::new();
            while batch.len() < batch_size {
                match frontier.pop_front() {
                    Some(item) => batch.push(item),
                    None => break,
                }
            }

            progress.set_message(format!(
                "Fetching {} page(s), {} queued",
                batch.len(),
                frontier.len()
            ));

            // One batch of concurrent fetches, joined before the frontier is
            // re-evaluated so visited mutations are fully applied.
            let results = join_all(batch.into_iter().map(|(url, depth)| {
                let progress = progress.clone();
                async move { (depth, self.process_document(url, &progress).await) }
            }))
            .await;

            for (depth, links) in results {
                self.enqueue_links(&mut frontier, links, depth);
            }
        }

        self.write_index();

        progress.finish_and_clear();

        let report = self.build_report(outcome, start_bytes);
        tracing::info!(
            outcome = ?report.outcome,
            pages = report.pages_cached,
            resources = report.resources_cached,
            bytes = report.bytes_downloaded,
            failures = report.errors.len(),
            "capture session finished"
        );
        Ok(report)
    }

    /// Fetches one document, captures its leaf resources, rewrites it
    /// against the cache, and persists it. Returns the page links it
    /// discovered; failures are recorded and yield no links.
    async fn process_document(&self, url: Url, progress: &ProgressBar) -> Vec<RemoteResource> {
        let key = cache_key(&url);
        self.set_state(&key, ResourceKind::Document, ResourceState::Fetching);
        progress.set_message(format!("Downloading: {}", url));

        let html = match self.fetcher.fetch_text(&url).await {
            Ok(html) => html,
            Err(e) => {
                self.record_failure(&url, &e.to_string());
                self.set_state(&key, ResourceKind::Document, ResourceState::Failed);
                return Vec::new();
            }
        };

        // Leaves are captured before the page is rewritten so the resolver
        // sees their cache entries.
        for leaf in self.extractor.discover_leaves(&html, &url) {
            self.capture_leaf(&leaf).await;
        }

        let links = self.extractor.discover_links(&html, &url);

        let rewritten = match Rewriter::new(url.clone()) {
            Ok(rewriter) => {
                let store = self.store.clone();
                rewriter.rewrite(&html, |resource_url| {
                    let resource_key = cache_key(resource_url);
                    if store.contains(&resource_key) {
                        Some(resource_key)
                    } else {
                        None
                    }
                })
            }
            Err(e) => {
                tracing::error!(url = %url, "rewriter construction failed: {}", e);
                html.clone()
            }
        };
        let page = merge_script(&rewritten, NAV_SCRIPT);

        match self
            .store
            .put(&key, page.as_bytes(), self.options.ttl, self.options.compress)
        {
            Ok(()) => self.set_state(&key, ResourceKind::Document, ResourceState::Cached),
            Err(e) => {
                // Storage failure leaves the page uncached; references to it
                // keep pointing offsite.
                self.record_failure(&url, &format!("storage error: {}", e));
                self.set_state(&key, ResourceKind::Document, ResourceState::Failed);
            }
        }

        links
    }

    /// Captures one leaf resource (stylesheet, script, image, video).
    /// No recursive extraction, except that a stylesheet's `url()` assets
    /// are captured too so it renders offline.
    async fn capture_leaf(&self, leaf: &RemoteResource) {
        let key = cache_key(&leaf.url);
        if !self.mark_visited(&key, leaf.kind) {
            return;
        }
        self.set_state(&key, leaf.kind, ResourceState::Fetching);

        let bytes = match self.fetcher.fetch(&leaf.url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.record_failure(&leaf.url, &e.to_string());
                self.set_state(&key, leaf.kind, ResourceState::Failed);
                return;
            }
        };

        if leaf.kind == ResourceKind::Stylesheet {
            if let Ok(css) = std::str::from_utf8(&bytes) {
                let assets: Vec<Url> = self
                    .extractor
                    .extract_css_urls(css)
                    .iter()
                    .filter_map(|raw| resolve_url(&leaf.url, raw))
                    .filter(|u| matches!(u.scheme(), "http" | "https"))
                    .collect();
                for asset in assets {
                    self.capture_css_asset(&asset).await;
                }
            }
        }

        let compress = self.options.compress && leaf.kind.is_text();
        match self.store.put(&key, &bytes, self.options.ttl, compress) {
            Ok(()) => self.set_state(&key, leaf.kind, ResourceState::Cached),
            Err(e) => {
                self.record_failure(&leaf.url, &format!("storage error: {}", e));
                self.set_state(&key, leaf.kind, ResourceState::Failed);
            }
        }
    }

    /// Captures an asset referenced from stylesheet text. Strictly terminal:
    /// nothing is extracted from it.
    async fn capture_css_asset(&self, url: &Url) {
        let key = cache_key(url);
        if !self.mark_visited(&key, ResourceKind::Image) {
            return;
        }
        self.set_state(&key, ResourceKind::Image, ResourceState::Fetching);

        match self.fetcher.fetch(url).await {
            Ok(bytes) => match self.store.put(&key, &bytes, self.options.ttl, false) {
                Ok(()) => self.set_state(&key, ResourceKind::Image, ResourceState::Cached),
                Err(e) => {
                    self.record_failure(url, &format!("storage error: {}", e));
                    self.set_state(&key, ResourceKind::Image, ResourceState::Failed);
                }
            },
            Err(e) => {
                self.record_failure(url, &e.to_string());
                self.set_state(&key, ResourceKind::Image, ResourceState::Failed);
            }
        }
    }

    /// Applies one batch's discovered links to the frontier. Runs only
    /// between batches, after the join barrier.
    fn enqueue_links(
        &self,
        frontier: &mut VecDeque<(Url, usize)>,
        links: Vec<RemoteResource>,
        parent_depth: usize,
    ) {
        let depth = parent_depth + 1;
        if self.options.max_depth > 0 && depth > self.options.max_depth {
            return;
        }
        for link in links {
            if self.options.same_origin && link.url.origin() != self.root.origin() {
                tracing::debug!(url = %link.url, "skipping off-origin link");
                continue;
            }
            let key = cache_key(&link.url);
            // Visited before enqueue. This is what makes the crawl terminate
            // over cyclic link graphs.
            if self.mark_visited(&key, ResourceKind::Document) {
                frontier.push_back((link.url, depth));
            }
        }
    }

    /// Generates the navigation index over everything mirrored so far and
    /// stores it as an ordinary cache entry.
    fn write_index(&self) {
        let keys = self.store.list_keys();
        let mut html = String::new();
        html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
        html.push_str(&format!("<title>Offline mirror of {}</title>\n", self.root));
        html.push_str("</head>\n<body>\n");
        html.push_str(&format!("<h1>Offline mirror of {}</h1>\n<ul>\n", self.root));
        for key in keys.iter().filter(|k| k.as_str() != INDEX_KEY) {
            html.push_str(&format!(
                "<li><a href=\"{}{}\">{}</a></li>\n",
                LOCAL_SCHEME, key, key
            ));
        }
        html.push_str("</ul>\n</body></html>\n");

        let index = merge_script(&html, NAV_SCRIPT);
        if let Err(e) = self
            .store
            .put(INDEX_KEY, index.as_bytes(), self.options.ttl, self.options.compress)
        {
            tracing::error!("failed to store navigation index: {}", e);
        }
    }

    fn build_report(&self, outcome: SessionOutcome, start_bytes: u64) -> CaptureReport {
        let states = self.states.lock().unwrap();
        let pages_cached = states
            .values()
            .filter(|(kind, state)| *kind == ResourceKind::Document && *state == ResourceState::Cached)
            .count();
        let resources_cached = states
            .values()
            .filter(|(kind, state)| *kind != ResourceKind::Document && *state == ResourceState::Cached)
            .count();

        CaptureReport {
            root_url: self.root.clone(),
            outcome,
            pages_cached,
            resources_cached,
            bytes_downloaded: self.quota.bytes_downloaded().saturating_sub(start_bytes),
            errors: self.errors.lock().unwrap().clone(),
        }
    }

    /// Returns true when the key was not yet visited. The caller then owns
    /// capturing it.
    fn mark_visited(&self, key: &str, kind: ResourceKind) -> bool {
        let mut visited = self.visited.lock().unwrap();
        if visited.insert(key.to_string()) {
            self.states
                .lock()
                .unwrap()
                .insert(key.to_string(), (kind, ResourceState::Pending));
            true
        } else {
            false
        }
    }

    fn set_state(&self, key: &str, kind: ResourceKind, state: ResourceState) {
        self.states
            .lock()
            .unwrap()
            .insert(key.to_string(), (kind, state));
    }

    fn state_of(&self, key: &str) -> Option<ResourceState> {
        self.states.lock().unwrap().get(key).map(|(_, state)| *state)
    }

    fn record_failure(&self, url: &Url, reason: &str) {
        tracing::warn!(url = %url, "capture failure: {}", reason);
        self.errors.lock().unwrap().push(CaptureFailure {
            url: url.to_string(),
            reason: reason.to_string(),
        });
    }
}
