pub mod agent;
pub mod constants;
pub mod controller;
pub mod deprovision;
pub mod error;
pub mod machinery;
pub mod provision;
pub mod repository;
pub mod resources;
pub mod source;
pub mod utils;
