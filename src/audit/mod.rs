// ABOUTME: Audit module — the append-only record of every authentication and authorization decision.
// ABOUTME: JSONL-backed log with monotonic sequence numbers and history queries over a bounded tail.

pub mod log;

pub use log::*;
