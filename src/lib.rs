pub mod backend;
pub mod config;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod models;
pub mod server;
pub mod translate;

pub use backend::{Backend, VertexClient};
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use logging::SharedLogger;
pub use server::{build_router, AppState};
