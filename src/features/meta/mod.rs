pub mod models;
pub mod service;
pub mod validate;

pub use models::*;
pub use service::MetaService;
