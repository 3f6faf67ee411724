//! HTTP/JSON control plane: admission, dispatch, status, results, events,
//! deployments, plus the self-healer and wake-up background tasks.

pub mod api_errors;
pub mod auth;
pub mod config;
pub mod handlers;
pub mod healer;
pub mod state;
pub mod wakeup;

pub use api_errors::ApiError;
pub use config::ServerConfig;
pub use handlers::build_router;
pub use healer::SelfHealer;
pub use state::AppState;
pub use wakeup::{DeploymentProvider, ProviderError, ProviderRegistry, WakeupNotifier};
