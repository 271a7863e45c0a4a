//! User-facing notification channel.
//!
//! Lock contention and configuration save failures must reach the user, not
//! only the log. The channel is injected into `MasterDao`.

use tracing::{error, info};

pub trait Notifier: Send + Sync {
    fn info(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards notifications to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn info(&self, message: &str) {
        info!(target: "segstore::user", "{}", message);
    }

    fn error(&self, message: &str) {
        error!(target: "segstore::user", "{}", message);
    }
}
