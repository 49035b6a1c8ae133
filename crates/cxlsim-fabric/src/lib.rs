//! cxlsim-fabric — links, credits, transaction state machines, switches, and
//! endpoint shells. Every component is an owned value driven by `poll`, with
//! an async `run` loop for running it on its own tokio task.

pub mod capture;
pub mod credit;
pub mod endpoint;
pub mod link;
pub mod port;
pub mod stats;
pub mod switch;
pub mod topology;
pub mod transaction;

pub use capture::{CaptureRecord, CaptureSink, MemoryCapture, TracingCapture};
pub use credit::{CreditError, CreditManager, Direction};
pub use endpoint::{Endpoint, EndpointHandle, Request, RequestHandler, SparseMemory};
pub use link::{establish, Link, LinkConfig, SendError};
pub use port::{PortEntry, PortId, PortRole, PortTable, RouteError};
pub use stats::{Counter, FabricStats, StatsSnapshot};
pub use switch::Switch;
pub use topology::{build, Fabric, TopologyError};
pub use transaction::{IssueError, Outcome, Response, StateMachine, TransactionHandle, TxnId, TxnState};
