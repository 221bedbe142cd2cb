pub mod config;
pub mod error;
pub mod logging;
pub mod server;
pub mod translate;
pub mod upstream;
pub mod validate;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use logging::SharedLogger;
pub use server::{build_router, AppState};
pub use upstream::UpstreamAdapter;
