mod component;
mod runner;

pub use component::{
    Component,
    ConnectDetails,
    SessionContext,
};
pub use runner::{
    ReconnectPolicy,
    Runner,
    RunnerConfig,
    RunnerHandle,
};
