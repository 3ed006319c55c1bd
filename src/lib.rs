//! PinPay relay, library crate.
//!
//! The binary in `main.rs` wires these modules together; integration tests in
//! `tests/` drive them directly.

pub mod api;
pub mod capture;
pub mod cli;
pub mod clock;
pub mod config;
pub mod errors;
pub mod guard;
pub mod issuer;
pub mod jobs;
pub mod lifecycle;
pub mod models;
pub mod notification;
pub mod relay;
pub mod retry;
pub mod store;

use capture::AuthorizationCapture;
use lifecycle::Lifecycle;
use models::TokenDomain;
use relay::RelaySubmitter;

/// Shared state handed to every HTTP handler.
pub struct AppState {
    pub lifecycle: Lifecycle,
    pub capture: AuthorizationCapture,
    pub submitter: RelaySubmitter,
    pub domain: TokenDomain,
    /// Merchant key; `None` leaves merchant routes open.
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(
        lifecycle: Lifecycle,
        submitter: RelaySubmitter,
        domain: TokenDomain,
        api_key: Option<String>,
    ) -> Self {
        Self {
            capture: AuthorizationCapture::new(lifecycle.clone()),
            lifecycle,
            submitter,
            domain,
            api_key,
        }
    }
}
