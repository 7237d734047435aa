use clap::{Parser, Subcommand};

mod commands;
mod logging;

use commands::{AddUnderlyingArgs, ClearTradesArgs, DatabaseArgs, PositionsArgs, RunArgs};

#[derive(Parser)]
#[command(name = "straddle")]
#[command(about = "Intraday long-straddle trader for Interactive Brokers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trade one session: wait for the open, trade, flatten before the close
    Run(RunArgs),
    /// Create the database and apply migrations
    InitDb(DatabaseArgs),
    /// Register an underlying to trade
    AddUnderlying(AddUnderlyingArgs),
    /// List registered underlyings
    ListUnderlyings(DatabaseArgs),
    /// Net open positions from the trade log
    Positions(PositionsArgs),
    /// Delete every logged trade (paper testing only)
    ClearTrades(ClearTradesArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Sessions log to a dated file once their mode is known.
    if !matches!(cli.command, Commands::Run(_)) {
        logging::init_stderr("warn");
    }

    match cli.command {
        Commands::Run(args) => commands::run_session(args).await?,
        Commands::InitDb(args) => commands::run_init_db(args).await?,
        Commands::AddUnderlying(args) => commands::run_add_underlying(args).await?,
        Commands::ListUnderlyings(args) => commands::run_list_underlyings(args).await?,
        Commands::Positions(args) => commands::run_positions(args).await?,
        Commands::ClearTrades(args) => commands::run_clear_trades(args).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_takes_account_and_port() {
        let cli = Cli::parse_from(["straddle", "run", "--account", "DU1", "--port", "4002", "--testing"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.account.as_deref(), Some("DU1"));
        assert_eq!(args.port, Some(4002));
        assert!(args.testing);
        assert_eq!(args.config, "config/Config.toml");
    }
}
