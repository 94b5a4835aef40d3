pub mod coordinator;
pub mod ledger;
pub mod record;
pub mod store;

pub use coordinator::{AgentScope, ScopeContext, ScopeRequest};
pub use ledger::ArtifactLedger;
pub use record::{ScopeRecord, ScopeState};
pub use store::ScopeStore;
