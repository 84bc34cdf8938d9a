//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `init`   | `Init`           |
//! | `config` | `CheckConfig`    |

pub mod config;
pub mod init;
pub mod serve;

pub use config::{cmd_check_config, load_config};
pub use init::cmd_init;
pub use serve::cmd_serve;
