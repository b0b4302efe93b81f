pub mod models;
pub mod routes;
pub mod service;

pub use models::*;
pub use service::{AdminError, AdminService};
