//! Admission control: IP allowlist and single-session exclusivity.

pub mod gate;

pub use gate::{may_claim, AccessDecision, AccessGate, NetworkRange, DEFAULT_ALLOWED_NETWORKS};
