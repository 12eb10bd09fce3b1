// src/main.rs

use watchrun::{cli, logging};

#[tokio::main]
async fn main() {
    let args = cli::parse();

    if let Err(e) = logging::init_logging(args.log_level) {
        eprintln!("failed to initialise logging: {e}");
        std::process::exit(1);
    }

    if let Err(e) = watchrun::run(args).await {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}
