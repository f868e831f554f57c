pub mod broadcaster;
pub mod config;
pub mod constants;
pub mod database;
pub mod db;
pub mod engine;
pub mod error;
pub mod parser;
pub mod registry;
pub mod restic;
pub mod restored;
pub mod runner;
pub mod scheduler;

pub use error::{Result, ResticError};
