// skyplan - intent-driven cloud infrastructure
//
// Short intents become reviewed plans, plans become AWS resources:
// - cli: clap command surface
// - commands: one function per verb
// - execute: plan walker and the AWS step handlers
//
// The library crates under crates/ hold the model, config, planner and AWS provider.

pub mod cli;
pub mod commands;
pub mod execute;
mod init;

use skyplan_core::SkyError;

pub use init::init_tracing;

/// Process exit code for an error: the first SkyError in the chain decides, 1 otherwise
pub fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<SkyError>())
        .map(|sky| sky.exit_code() as u8)
        .unwrap_or(1)
}
