//! # Sinter Core
//!
//! The core primitives of the Sinter dispatch engine.
//!
//! This crate holds everything that does not depend on plugins:
//!
//! - **Event model**: the canonical [`Event`] every stage reads
//! - **Normalization**: [`EventNormalizer`] turns raw adapter payloads into events
//! - **TTL primitive**: [`ExpiringMap`], shared by all cooldown scopes
//! - **History**: [`EventBus`] records recent events and fans them out
//! - **Reply port**: [`ReplyTransport`], attached to events by adapters
//!
//! ```text
//! raw payload ──▶ EventNormalizer ──▶ Arc<Event> ──▶ EventBus (record/publish)
//!                                            └──────▶ RuleRouter (sinter-framework)
//! ```

pub mod error;
pub mod event;
pub mod expiring;
pub mod history;
pub mod normalize;

pub use error::{BoxError, CoreError, CoreResult};
pub use event::{
    BoxedTransport, Category, Event, EventSource, MediaRef, ReplyTransport, Segment, SenderRole,
};
pub use expiring::ExpiringMap;
pub use history::{EventBus, HistoryConfig, SubscriberFn, Subscription};
pub use normalize::EventNormalizer;
