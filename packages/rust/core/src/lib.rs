//! Course and user-model dumps for the Aspects analytics warehouse.
//!
//! This crate holds the domain logic: flattening published course trees,
//! deciding when a course is stale, serializing warehouse rows, the model
//! sinks that write them, and the task queue that runs sinks on events.
//! Content stores and the warehouse are reached through [`adapters`].

pub mod adapters;
pub mod dispatch;
pub mod events;
pub mod flatten;
pub mod memory;
pub mod pipeline;
pub mod serializer;
pub mod sinks;
pub mod staleness;
