//! # pathspace-space
//!
//! The in-process half of the PathSpace remote mount subsystem:
//!
//! - **Typed value codec** via [`codec`]: a 4-byte little-endian size header
//!   followed by a CBOR body, with an exact round-trip law.
//! - **[`SlidingBuffer`]** append/advance byte buffer backing node queues.
//! - **[`NodeData`]** snapshot container: the serialized form of one node's
//!   value queue, shippable across the wire and lazily decodable.
//! - **Type registry** via [`registry`]: process-wide `name -> descriptor`
//!   table with erased construct/serialize/deserialize/insert/take, plus the
//!   payload bridge ([`registry::insert_typed_bytes`],
//!   [`registry::take_typed_bytes`]).
//! - **[`WaitMap`]** path-keyed condition variables with glob notification.
//! - **[`PathSpace`]** itself: a hierarchically-addressed space of typed
//!   value queues with blocking takes, visitation, mountable leaves, and a
//!   settable [`NotificationSink`].
//! - **[`SpaceRegistry`]** liveness guard so stale space references never
//!   get notified.
//!
//! ## Architecture
//!
//! ```text
//! insert<T> / read<T> / take<T>      (typed surface)
//!     |
//!     v
//! codec (header + CBOR)  <---->  TypeRegistry (erased ops)
//!     |
//!     v
//! PathSpace nodes (NodeData queues over SlidingBuffer)
//!     |
//!     +--> WaitMap notify        (local blocking waiters)
//!     +--> NotificationSink      (remote mount interposition)
//! ```

pub mod codec;
pub mod liveness;
pub mod node;
pub mod registry;
pub mod sliding;
pub mod space;
pub mod waitmap;

pub use liveness::SpaceRegistry;
pub use node::{NodeData, ValueRecord};
pub use registry::{TypeDescriptor, TypeRegistry};
pub use sliding::SlidingBuffer;
pub use space::{
    InsertPayload, InsertReturn, NotificationSink, OutOptions, PathSpace, SpaceContext, SpaceLeaf,
    VisitControl, VisitEntry, VisitOptions,
};
pub use waitmap::WaitMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Marker for values that can live in a [`PathSpace`].
///
/// Blanket-implemented for everything serde can round-trip; the type's
/// stable registry name defaults to [`std::any::type_name`].
pub trait PathValue: Serialize + DeserializeOwned + Send + 'static {}

impl<T: Serialize + DeserializeOwned + Send + 'static> PathValue for T {}

/// Default stable name for a value type.
pub fn type_name_of<T: 'static>() -> &'static str {
    std::any::type_name::<T>()
}
