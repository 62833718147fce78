pub mod access_log;
pub mod config;
pub mod constants;
pub mod dupes;
pub mod headers;
pub mod http_range;
pub mod lock;
pub mod logging;
pub mod origin;
pub mod pipeline;
pub mod server;
pub mod store;
pub mod stream;
