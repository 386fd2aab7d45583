pub mod config;
pub mod error;
pub mod store;
pub mod types;
pub mod vector;

pub use error::{VaultError, VaultResult};
pub use store::{DocStore, JsonStore, Query, Sort};
pub use vector::Vector;
