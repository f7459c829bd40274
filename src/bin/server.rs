use clap::Parser;
use moe_rebalancer::config::{Ctx, Env, setup_tracing};
use moe_rebalancer::launch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed_env = Env::parse();
    let ctx = Ctx::load_files(&parsed_env.config, &parsed_env.secrets)?;

    setup_tracing(&ctx.log_level);

    launch(ctx).await
}
