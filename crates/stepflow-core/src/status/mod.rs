//! Status event routing.
//!
//! Job and Workflow status changes are classified against a declarative
//! `RoutingTable` and delivered to a `StatusSink`. Nothing here is global;
//! the engine owns its `StatusReporter`.

pub mod reporter;
pub mod router;
pub mod sink;

pub use reporter::StatusReporter;
pub use router::{Channel, RoutingRule, RoutingTable, SubjectKind};
pub use sink::{RecordingSink, StatusRecord, StatusSink, TracingSink};
