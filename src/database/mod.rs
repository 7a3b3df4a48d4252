pub mod engine;
pub mod filter;
pub mod manager;
pub mod memory;
pub mod postgres;

pub use engine::{
    AggregateOp, EngineError, JsonMap, QueryArgs, StorageConn, StorageEngine, StorageTransaction,
};
pub use manager::{DatabaseError, DatabaseManager};
pub use memory::MemoryEngine;
pub use postgres::PgEngine;
