pub mod error;
pub mod migrations;
pub mod pool;
pub mod store;
pub mod types;

pub use error::DbError;
pub use pool::DbPool;
pub use store::PgStore;
pub use types::{DbOperation, DbValue, WhereClause};
