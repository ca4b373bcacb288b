//! CLI command implementations.
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `serve`    | `Serve`          |
//! | `agents`   | `Agents`         |
//! | `settings` | `Settings`       |

pub mod agents;
pub mod serve;
pub mod settings;

pub use agents::cmd_agents;
pub use serve::cmd_serve;
pub use settings::cmd_settings;
