pub mod alerts;
pub mod attendance;
pub mod backup_exchange;
pub mod classes;
pub mod core;
pub mod courses;
pub mod evaluations;
pub mod justifications;
pub mod notifications;
pub mod settings;
pub mod stats;
pub mod users;
