pub mod infra;
pub mod protocol;
pub mod runtime;
