pub mod api;
mod supervisor;

pub use api::{ApiClient, VmAction};
pub use supervisor::{Supervisor, VmRegistry};
