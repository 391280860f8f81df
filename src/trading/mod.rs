//! Copy engine: replication, position sync, phase evaluation and the watchdogs.

mod automation;
mod config;
mod copy_engine;
mod phase;
mod publisher;
mod session;
mod stops;
mod sync_watchdog;

pub use automation::AutomationWatchdog;
pub use config::{CopierConfig, PhaseConfig};
pub use copy_engine::{EngineSettings, ReplicationEngine, ReplicationResult};
pub use phase::{PhaseConclusion, PhaseStateMachine, PhaseVerdict};
pub use publisher::{SignalPublisher, DEFAULT_POLL_PERIOD};
pub use session::{SharedSession, TenantSession};
pub use sync_watchdog::SyncWatchdog;
