//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `serve`   | `Serve`          |
//! | `config`  | `Config`         |
//! | `analyze` | `Analyze`        |

pub mod analyze;
pub mod config;
pub mod serve;

pub use analyze::cmd_analyze;
pub use config::cmd_config;
pub use serve::{ServeOverrides, cmd_serve};
