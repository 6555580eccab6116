use clap::Parser;

use aevon::config::Env;
use aevon::{launch, setup_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Env::parse().into_config();
    setup_tracing(&config.log_level);
    launch(config).await
}
