// ============================================================================
// Infrastructure Actors
// ============================================================================
//
// - Health monitoring
// - Unpaid order reaper scheduling
// - Coordination and shutdown
//
// ============================================================================

use actix::prelude::*;

mod coordinator;
mod health_monitor;
mod reaper;

pub use coordinator::{CoordinatorActor, GetHealthMonitor, GetReaper, Shutdown};
pub use health_monitor::{GetSystemHealth, HealthMonitorActor, SystemHealth, UpdateHealth};
pub use reaper::{ActorScheduler, ClearSchedule, GetNextRun, ReaperActor, RunReaper, ScheduleRun};

/// Message to gracefully stop a child actor
#[derive(Message)]
#[rtype(result = "()")]
pub struct StopActor;
