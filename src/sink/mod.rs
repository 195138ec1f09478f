pub mod backend;
pub mod batcher;
pub mod clickhouse;
pub mod memory;

pub use backend::*;
pub use batcher::*;
pub use clickhouse::*;
pub use memory::*;
