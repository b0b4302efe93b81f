pub mod service;

pub use service::{Migration, MigrationError, MigrationService};
