// ============================================================================
// Actors Module
// ============================================================================
//
// Actix actors for the background side of the service.
//
// Structure:
// - core/           - Health types (HealthStatus, HealthCheckable)
// - infrastructure/ - Coordinator, health monitor, reaper host
//
// Note: Order operations run through `OrderService`, not actors.
//
// ============================================================================

mod core;
mod infrastructure;

pub use self::core::{ComponentHealth, HealthCheckable, HealthStatus};
pub use self::infrastructure::{
    ActorScheduler,
    ClearSchedule,
    CoordinatorActor,
    GetHealthMonitor,
    GetNextRun,
    GetReaper,
    GetSystemHealth,
    HealthMonitorActor,
    ReaperActor,
    RunReaper,
    ScheduleRun,
    Shutdown,
    StopActor,
    SystemHealth,
    UpdateHealth,
};
