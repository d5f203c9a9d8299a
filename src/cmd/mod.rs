//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`, `Reap`  |
//! | `hook`   | `Hook`           |
//! | `config` | `Config`         |

pub mod config;
pub mod hook;
pub mod serve;

pub use config::cmd_config;
pub use hook::cmd_hook;
pub use serve::{ServeOverrides, cmd_reap, cmd_serve};
