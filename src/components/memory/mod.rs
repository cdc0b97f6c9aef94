//! In-memory provider and mirror for offline runs and tests

pub mod mirror;
pub mod mock_behaviour;
pub mod provider;

pub use mirror::InMemoryMirror;
pub use mock_behaviour::MockBehaviour;
pub use provider::{instance_id, CallGate, InMemoryProvider};
