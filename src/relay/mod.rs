//! Change detection and ordered, durable delivery.
//!
//! - [`detector`] - pure decision of which window items are unseen
//! - [`delivery`] - webhook destination and per-item persisted relay
//! - [`cycle`] - one pass over every configured account

mod cycle;
mod delivery;
mod detector;

pub use cycle::{run_cycle, AccountOutcome, AccountReport, CycleError, CycleOptions, CycleReport};
pub use delivery::{
    relay_batch, render_message, DeliveryError, Destination, RelayReport, WebhookDelivery,
};
pub use detector::{detect, ChangeSet, Detection};
