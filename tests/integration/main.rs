//! cxlsim integration test harness.
//!
//! Every scenario builds a fabric in-process from a `SimConfig` and drives
//! it either step by step through `poll` or with each component running on
//! its own task. No sockets, no root.
//!
//!   cargo test --test integration

mod infra;

mod end_to_end;
mod flow_control;
mod ordering;
mod routing;
mod timeouts;

pub use infra::*;
