pub mod admission;
pub mod cache;
pub mod center;
pub mod config;
pub mod doing;
pub mod error;
pub mod node;
pub mod replica;
pub mod report;
pub mod rpc;
pub mod scheduler;
pub mod shutdown;
pub mod store;

pub use error::{DispatchError, Result};
