//! Process supervisor for the relay fleet.

mod health;
mod manager;
pub mod process;

pub use health::spawn_health_loop;
pub use manager::{
    ChannelSpec, FleetGuard, ProcessState, ProcessStatus, Supervisor, SupervisorError,
    SupervisorPolicy,
};
pub use process::{ChildLauncher, Launcher, Process, ProcessExit, WorkerCommand};
