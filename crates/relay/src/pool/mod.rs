//! Server pool: candidate registry and health probing

mod prober;
mod registry;

pub use prober::HealthProber;
pub use registry::{FailureMark, ServerPoolRegistry};
