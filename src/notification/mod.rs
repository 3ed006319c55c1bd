pub mod status;
pub mod webhook;

pub use status::{StatusChange, StatusNotifier, Subscription};
pub use webhook::{WebhookEvent, WebhookNotifier, WebhookTargets};
