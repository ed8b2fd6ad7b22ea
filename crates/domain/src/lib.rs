pub mod entities;
pub mod repositories;
pub mod script;
pub mod sqlx_impls;
pub mod value_objects;

pub use entities::*;
pub use repositories::*;
pub use scheduler_core::{SchedulerError, SchedulerResult};
pub use script::*;
pub use value_objects::*;
