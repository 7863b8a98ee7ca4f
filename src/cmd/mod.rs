//! CLI command implementations.
//!
//! | Module   | Commands handled        |
//! |----------|-------------------------|
//! | `serve`  | `Serve`                 |
//! | `db`     | `InitDb`, `Status`      |

pub mod db;
pub mod serve;

pub use db::{cmd_init_db, cmd_status};
pub use serve::{ServeOverrides, cmd_serve, load_config};
