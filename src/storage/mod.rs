pub mod details;
pub mod pool;
pub mod reference;
pub mod sqlite;
