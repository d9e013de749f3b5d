pub mod action;
pub mod config;
pub mod context;
pub mod error;
pub mod injector;
pub mod keyring;
pub mod manifest;
pub mod migrations;
pub mod registry;
pub mod run;
pub mod runner;

pub use error::{ActionsError, Result};
