pub mod config;
pub mod errors;
pub mod fleet;
pub mod logging;
pub mod updater;
