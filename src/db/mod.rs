pub mod connection;
pub mod memory;
pub mod schema;
pub mod store;
pub mod surreal;

pub use connection::*;
pub use memory::MemoryStore;
pub use store::ExecutionStore;
pub use surreal::SurrealStore;
