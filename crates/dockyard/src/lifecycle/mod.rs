//! Resource lifecycle orchestration.

mod controller;
mod single_flight;

pub use controller::{
    LifecycleConfig, LifecycleController, LifecycleSettings, MANAGED_LABEL, ReconcileReport,
};
pub use single_flight::{FlightGuard, SingleFlight};
