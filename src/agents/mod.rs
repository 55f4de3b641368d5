//! Remote agents: identity, approval, liveness and registration codes.

mod locks;
mod model;
mod regcode;
mod registry;
mod sweeper;
pub mod token;

pub use model::{
    Agent, AgentStatus, AgentUpdate, HeartbeatInfo, NewAgent, PendingStatus, RegisterRequest,
};
pub use regcode::{
    CodeRejection, CreateCodeRequest, NewRegistrationCode, RegistrationCode,
    RegistrationCodeIssuer,
};
pub use registry::{AgentRegistry, LIVENESS_WINDOW};
pub use sweeper::{LivenessSweeper, SweeperConfig, spawn_sweeper};
