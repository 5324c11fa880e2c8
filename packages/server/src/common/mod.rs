pub mod error;
pub mod pagination;
pub mod paths;

pub use error::{AdapterError, CoreError, CoreResult};
