pub mod app;
pub mod config;
pub mod crm;
pub mod error;
pub mod handler;
pub mod preflight;
pub mod ura;
pub mod version;
