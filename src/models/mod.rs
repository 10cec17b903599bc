pub mod health;
pub mod diagnostics;
pub mod document;
pub mod error;
pub mod messages;
pub mod permissions;
pub mod room_name;
pub mod source;

pub use health::*;
pub use diagnostics::*;
pub use document::{Document, DocumentChange, DocumentError, DocumentKind, SubscriptionId};
pub use error::*;
pub use permissions::Permissions;
pub use room_name::DocumentPath;
pub use source::Source;
