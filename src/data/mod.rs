pub mod actor;
pub mod audit;
pub mod capabilities;
pub mod error;
pub mod service;
pub mod soft_delete;

pub use actor::{capture_actor, current_actor, with_actor, ActorIdentity, SYSTEM_ACTOR};
pub use capabilities::{capabilities_for, capabilities_map, EntityCapabilities};
pub use error::DataError;
pub use service::{DataService, DataTransaction, EntitySet};
