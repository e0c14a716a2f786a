// Library exports for integration tests and reusable components

pub mod config;
pub mod notifications;
pub mod upload;
