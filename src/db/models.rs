mod fleet;
mod history;
mod lock;
mod marker;

pub use fleet::{FleetMember, MemberStatus};
pub use history::{HistoryEntry, HistoryOutcome, HistoryPhase};
pub use lock::{LockGrant, LockRecord};
pub use marker::{PendingCleanup, VersionMarker};
