use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::quota::{DEFAULT_HARD_CAP, DEFAULT_SOFT_THRESHOLD};
use crate::session::CaptureOptions;

#[derive(Parser, Debug)]
#[command(
    name = "pagevault",
    about = "Captures a web page and its linked subtree into an offline mirror",
    version,
    long_about = "Recursively downloads a page, its linked pages, and the stylesheets, \
scripts, images, and video they reference, rewrites references to a local cache scheme, \
and persists everything to a browsable artifact cache."
)]
pub struct CaptureCommand {
    /// The HTTPS URL of the page to capture
    #[arg(required = true)]
    pub url: String,

    /// Directory for the artifact cache
    #[arg(short = 'o', long, default_value = "./mirror_cache")]
    pub cache_dir: PathBuf,

    /// Maximum concurrent in-flight fetches
    #[arg(short = 'c', long, default_value = "8")]
    pub max_concurrent: usize,

    /// Maximum link depth from the root (0 = unlimited)
    #[arg(short = 'd', long, default_value = "0")]
    pub max_depth: usize,

    /// Hard cap on downloaded bytes; the session aborts once it is reached
    #[arg(long, default_value_t = DEFAULT_HARD_CAP)]
    pub hard_cap_bytes: u64,

    /// Soft threshold past which fetch fan-out is reduced
    #[arg(long, default_value_t = DEFAULT_SOFT_THRESHOLD)]
    pub soft_threshold_bytes: u64,

    /// Cache entry lifetime in seconds (omit for entries that never expire)
    #[arg(long)]
    pub ttl_secs: Option<u64>,

    /// Store text entries uncompressed
    #[arg(long)]
    pub no_compress: bool,

    /// Only recurse into links on the root's origin
    #[arg(long)]
    pub same_origin: bool,

    /// User agent string to use for requests
    #[arg(long, default_value = "Pagevault/0.1")]
    pub user_agent: String,

    /// Timeout for requests in seconds
    #[arg(long, default_value = "30")]
    pub timeout: u64,
}

impl CaptureCommand {
    pub fn to_options(&self) -> CaptureOptions {
        let mut options = CaptureOptions::default();
        options.max_concurrency = self.max_concurrent;
        options.hard_cap_bytes = self.hard_cap_bytes;
        options.soft_threshold_bytes = self.soft_threshold_bytes;
        options.ttl = self.ttl_secs.map(Duration::from_secs);
        options.compress = !self.no_compress;
        options.max_depth = self.max_depth;
        options.same_origin = self.same_origin;
        options.user_agent = self.user_agent.clone();
        options.timeout = Duration::from_secs(self.timeout);
        options
    }
}
