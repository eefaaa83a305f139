//! Persistence layer - JSON document storage for instance records

mod store;

pub use store::InstanceStore;
