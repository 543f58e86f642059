//! Adapters - Concrete implementations of ports, plus the HTTP inbound side.

pub mod http;
pub mod http_fetcher;
pub mod process;
pub mod ytdlp;

pub use http_fetcher::HttpFetcher;
pub use process::TokioCommandRunner;
pub use ytdlp::YtDlpResolver;
