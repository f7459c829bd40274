use clap::Parser;
use std::process::ExitCode;

use moe_rebalancer::config::{Ctx, Env};

fn main() -> ExitCode {
    let env = Env::parse();
    match Ctx::load_files(&env.config, &env.secrets) {
        Ok(ctx) => {
            eprintln!("Config validation passed (owner {})", ctx.owner());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Config validation failed: {}", e.kind());
            if let moe_rebalancer::config::ConfigError::Invalid(message) = &e {
                eprintln!("  {message}");
            }
            ExitCode::FAILURE
        }
    }
}
