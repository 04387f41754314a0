//! slotdb server CLI: loads configuration, opens every table under
//! `--data-dir`, starts the session dispatcher, and blocks on the TCP
//! gateway.
//!
//! Grounded on `omendb-omen/src/bin/backup_tool.rs`'s `clap::Parser`
//! CLI shape (flat top-level flags, no subcommands needed here since
//! there is only one thing to run).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use slotdb::catalog;
use slotdb::config::Config;
use slotdb::dispatcher::Dispatcher;
use slotdb::gateway::Gateway;
use slotdb::logging::{self, LogConfig};
use slotdb::registry::Registry;

#[derive(Parser)]
#[command(author, version, about = "An in-process, file-backed storage engine server", long_about = None)]
struct Cli {
    /// Optional `slotdb.toml` to layer over the built-in defaults.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides the configured data directory.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Overrides the configured session slot count.
    #[arg(long, value_name = "N")]
    slots: Option<usize>,

    /// Use JSON-formatted logs instead of pretty ones.
    #[arg(long)]
    json_logs: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(slots) = cli.slots {
        config.session_slots = slots;
    }
    config.validate().context("validating configuration")?;

    logging::init_logging(LogConfig {
        level: config.log_level.clone(),
        json_format: cli.json_logs || config.log_json,
        log_spans: false,
    })
    .context("initializing logging")?;

    tracing::info!(data_dir = %config.data_dir.display(), slots = config.session_slots, "starting slotdb");

    let definitions = catalog::load_table_definitions(&config.data_dir)
        .with_context(|| format!("loading table schemas from {:?}", config.data_dir))?;
    let registry = Arc::new(
        Registry::open(&config.data_dir, &definitions)
            .with_context(|| format!("opening tables under {:?}", config.data_dir))?,
    );

    let dispatcher = Dispatcher::new(registry, config.session_slots);
    dispatcher.start();

    let gateway = Gateway::new(dispatcher.clone());
    gateway.run(&config.listen_addr).context("running TCP gateway")?;

    dispatcher.stop();
    Ok(())
}
