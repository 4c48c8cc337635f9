// src/main.rs

use analysis_worker::{cli, logging, run};

fn main() {
    if let Err(err) = run_main() {
        eprintln!("analysis-worker error: {err:?}");
        std::process::exit(1);
    }
}

fn run_main() -> anyhow::Result<()> {
    // A missing .env file is fine; the real environment still applies.
    let _ = dotenvy::dotenv();

    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    run(args)
}
