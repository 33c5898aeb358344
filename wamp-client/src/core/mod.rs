pub mod close;
pub mod error;
pub mod id;
pub mod invocation_policy;
pub mod match_style;
pub mod roles;
pub mod service;
pub mod stream;
pub mod types;
pub mod uri;
