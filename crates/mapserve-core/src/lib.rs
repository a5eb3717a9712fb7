// src/lib.rs
#[cfg(not(target_os = "linux"))]
compile_error!("mapserve-core requires Linux (epoll)");

pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod listing;
pub mod logging;
pub mod metrics;
pub mod mmap;
pub mod multipart;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod resolver;
pub mod response;
pub mod server;
pub mod slab;
pub mod syscalls;

// Re-exports for users
pub use config::Config;
pub use error::{ServerError, ServerResult};
pub use http::{HttpCode, Method, Request};
pub use logging::{init_logging, init_logging_json, init_logging_with_level};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use resolver::Resolver;
pub use server::{Server, ServerContext};
