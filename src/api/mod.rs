//! Clients for the remote store (signal log, tenant directory) and notifications.

mod directory;
mod notifier;
mod signal_log;
mod supabase;
mod types;

pub use directory::{SupabaseDirectory, TenantDirectory};
pub use notifier::{Audience, LogNotifier, Notifier, WebhookNotifier};
pub use signal_log::{SignalLog, SupabaseSignalLog, DEFAULT_SIGNAL_TABLE};
pub use supabase::SupabaseClient;
