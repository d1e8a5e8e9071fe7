//! # huddle-core
//!
//! Rooms, sessions, and message delivery for the Huddle chat relay.
//!
//! - **Store** - Rooms, their members, and the reconnect token index
//! - **Handler** - Applies client events to the store and produces deliveries
//! - **Delivery** - Single-consumer queue that performs every socket write
//! - **Connection** - Registry of live connection sinks
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Read loop  │────▶│   Handler   │────▶│ DeliveryBus │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │                   │
//!                            ▼                   ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │ EntityStore │◀────│   Worker    │──▶ sockets
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod connection;
pub mod delivery;
pub mod handler;
pub mod store;

#[cfg(test)]
mod testing;

pub use connection::ConnectionRegistry;
pub use delivery::{Delivery, DeliveryBus, DeliveryQueue, DeliveryReport, DeliveryWorker, Target};
pub use handler::{CommandHandler, ErrorHook, FrameOutcome};
pub use store::{EntityStore, Room, RoomSummary, RoomTable, StoreError, StoreStats, Token, User};
