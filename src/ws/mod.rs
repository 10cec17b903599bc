pub mod connctx;
pub mod connection;
pub mod error;
pub mod hub;
pub mod persistence;
pub mod registry;
pub mod relay;
pub mod room;

pub use connection::serve;
pub use hub::{HubSettings, SyncHub};
