// ABOUTME: Voice biometric module — sample features, three-sample enrollment, and verification.
// ABOUTME: A single cosine threshold against the enrollment centroid decides a match.

pub mod features;
pub mod store;

pub use features::*;
pub use store::*;
