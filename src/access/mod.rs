// ABOUTME: Privilege escalation core — keyword policy, command filter, grant ledger, and the engine.
// ABOUTME: The engine is the only entry point callers need; the parts are public for testing and embedding.

pub mod engine;
pub mod filter;
pub mod keyword;
pub mod ledger;
pub mod sweep;
pub mod types;

pub use engine::*;
pub use filter::*;
pub use keyword::*;
pub use ledger::*;
pub use sweep::*;
pub use types::*;
