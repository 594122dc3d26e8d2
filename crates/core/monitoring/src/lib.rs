//! Observability setup shared by every workspace crate.

pub mod logging;
