pub mod change;
pub mod config;
pub mod error;
pub mod event;
pub mod jid;
pub mod model;

pub use change::{ChangeOp, StoreChange, Tier, WriteKind};
pub use error::{EventBusError, PerchError, Result};
