//! CLI command implementations.
//!
//! | Module     | Commands handled                         |
//! |------------|------------------------------------------|
//! | `run`      | `Run`, `Reconcile`                       |
//! | `status`   | `Status`, `Summary`                      |
//! | `prefix`   | `Prefix`                                 |
//! | `generate` | `Generate`                               |
//! | `config`   | `Config`                                 |

pub mod config;
pub mod generate;
pub mod prefix;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use generate::cmd_generate;
pub use prefix::cmd_prefix;
pub use run::{cmd_reconcile, cmd_run};
pub use status::{cmd_status, cmd_summary};

use anyhow::Result;
use serde::Serialize;

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
