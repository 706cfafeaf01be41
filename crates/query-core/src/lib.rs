pub mod error;
pub mod rows;
pub mod schema;
pub mod types;

pub use error::{QueryError, Result};
pub use rows::{Row, RowsGroup};
pub use schema::{Field, Schema};
pub use types::*;
