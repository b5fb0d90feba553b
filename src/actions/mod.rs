//! Asynchronous adapters around the handler's install and uninstall calls.
//!
//! Each action reports exactly one `Outcome<()>` through its sink unless it
//! was cancelled first. A handler result of `false` is reported as a failure.

mod start;
mod stop;

pub use start::StartAction;
pub use stop::StopAction;

use crate::dependency::{CancelableListener, Outcome};
use crate::error::AppManagerError;
use crate::handler::InstallInfo;

/// Receives the single completion of a start or stop action
pub type ActionSink = CancelableListener<Outcome<()>>;

fn handler_result(outcome: &Outcome<bool>, operation: &'static str, info: &InstallInfo) -> Outcome<()> {
    match outcome {
        Ok(true) => Ok(()),
        Ok(false) => Err(AppManagerError::handler(
            operation,
            info.config.label(),
            format!("{} reported failure", info.handler.name()),
        )
        .into_cause()),
        Err(cause) => Err(cause.clone()),
    }
}
