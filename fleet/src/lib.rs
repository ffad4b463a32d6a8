mod balancer;
mod manager;

pub use balancer::LoadBalancer;
pub use manager::{
    FailoverCallback, FaultToleranceConfig, FaultToleranceManager, HealthEvent, HealthState,
    NodeHealth, RecoveryCallback,
};
