//! Resource records, kind profiles and persistence.

mod kind;
mod models;
mod repository;

pub use kind::{KindProfile, ResourceKind, StopPolicy, profile};
pub use models::{
    RegisterResourceRequest, Resource, ResourceStatus, container_name_for, timestamp,
    volume_name_for,
};
pub use repository::ResourceRepository;
