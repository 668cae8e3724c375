pub mod cli;
pub mod error;
pub mod model;
pub mod privilege;
pub mod probe;
pub mod query;
pub mod sampler;
pub mod storage;
