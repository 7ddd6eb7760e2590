//! Logic modules: pure computations over the registry and the ledger.
//!
//! # Modules
//!
//! - `resolver`: dependency ordering of pending units
//! - `status`: read-only status composition

pub mod resolver;
pub mod status;
