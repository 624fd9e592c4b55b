//! Subscriptions to key changes.
//!
//! Two delivery modes are supported:
//! - callbacks, invoked with `(value, matched_key)` as soon as the writing
//!   operation finishes its in-memory update
//! - managed state, where the store writes selected values into a named
//!   slice of a [`StateTarget`] and coalesces bursts into one visible update
//!
//! A subscription on a collection key hears about every member. A selector
//! can project each value before it is delivered; managed subscribers only
//! see a replacement when the selected value actually differs.
//!
//! # Example
//!
//! ```ignore
//! let id = store
//!     .connect(ConnectOptions::callback("session", |value, key| {
//!         println!("{key} is now {value:?}");
//!     }))
//!     .await?;
//!
//! store.set("session", json!({"token": "abc"})).await?;
//! store.disconnect(id);
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub(crate) use types::Notification;
pub use types::{
    ConnectOptions, Delivery, KeyCallback, Selector, SliceUpdater, StateTarget,
};
