//! Client for the rat room sync hub.
//!
//! ```rust,ignore
//! use ratroom_client::{ClientConfig, Mirror, connect};
//!
//! let mirror = Mirror::default();
//! mirror.balance().subscribe(|b| println!("balance: {b}"));
//! let client = connect(ClientConfig::new("ws://localhost:3131", "rat_123")?, mirror);
//! ```

mod cell;
mod connection;
mod mirror;

pub use cell::{Cell, SubscriptionId};
pub use connection::{ClientConfig, ClientError, ClientHandle, connect};
pub use mirror::{Applied, DEFAULT_HISTORY_LEN, Mirror};
pub use ratroom_core::{ConnectionState, OffChainMessage, RatId};
