//! Device-manager capability traits, registries, session actor, and mocks.

pub mod capabilities;
pub mod mock;
pub mod registry;
pub mod session;
