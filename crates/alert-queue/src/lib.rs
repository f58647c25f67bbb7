//! # Alert Queue
//!
//! Delivery bookkeeping for fanning alerts out to many recipients over one
//! channel. Nothing in this crate performs I/O: a channel agent owns a
//! [`Recipients`] registry and a [`Throttle`], feeds them alerts and
//! transport callbacks on a single task, and carries out the
//! [`AuthAction`]s and [`Delivery`] steps they return.
//!
//! - [`RecipientQueue`]: bounded, age-expiring FIFO with a retry segment
//! - [`ReadySet`]: recipients that are authorized and have work
//! - [`Authorization`]: per-recipient authorization state machine
//! - [`Throttle`]: global send-rate limit with deferred wake-up
//!
//! ## Example
//!
//! ```
//! use std::time::Instant;
//! use alert_queue::{Authorization, Delivery, QueueLimits, Recipients, Throttle};
//!
//! let mut recipients = Recipients::new(QueueLimits::unbounded(), Authorization::new());
//! let mut throttle = Throttle::unlimited();
//!
//! recipients.add_msg("ops@example.com", "disk full", None);
//! assert_eq!(recipients.next_delivery(&mut throttle, Instant::now()), Delivery::Idle);
//!
//! recipients.on_granted("ops@example.com");
//! assert_eq!(
//!     recipients.next_delivery(&mut throttle, Instant::now()),
//!     Delivery::Send { address: "ops@example.com".to_string(), message: "disk full" },
//! );
//! ```

pub mod authorization;
pub mod ready_set;
pub mod recipient;
pub mod registry;
pub mod throttle;

pub use authorization::{AuthAction, Authorization, AuthorizationState, AuthorizationStatus};
pub use ready_set::ReadySet;
pub use recipient::{QueueChange, RecipientQueue, Timestamp};
pub use registry::{Delivery, QueueLimits, Recipient, Recipients, RecipientsStats};
pub use throttle::{MAX_INTERVAL, Throttle, ThrottleDecision};
