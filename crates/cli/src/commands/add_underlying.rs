//! Registers a new underlying in the `Underlying` table.
//!
//! In `manual` mode the conid is taken from `--conid`. In `auto` mode the
//! contract is qualified through the gateway and the returned conid (and,
//! on request, exchanges) are used.

use std::io::{self, BufRead, Write};

use anyhow::{bail, ensure, Context, Result};
use clap::{Args, ValueEnum};
use straddle_core::ConfigLoader;
use straddle_data::{Database, NewUnderlying};
use straddle_ib::{Broker, SecType, UnderlyingContract};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LookupMode {
    /// Use the conid given with `--conid`
    Manual,
    /// Qualify the contract through the gateway
    Auto,
}

/// Arguments for registering an underlying.
#[derive(Args, Debug, Clone)]
pub struct AddUnderlyingArgs {
    #[arg(long, value_enum, ignore_case = true)]
    pub mode: LookupMode,

    #[arg(long)]
    pub symbol: String,

    /// STK (stocks and ETFs) or IND
    #[arg(long)]
    pub sec_type: String,

    /// AMERICAN or EUROPEAN
    #[arg(long)]
    pub option_style: String,

    /// 1 if the options get section 1256 (60/40) treatment, else 0
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=1))]
    pub is_1256_contract: u8,

    /// CASH or PHYSICAL
    #[arg(long)]
    pub option_settlement: String,

    #[arg(long, default_value = "USD")]
    pub currency: String,

    #[arg(long, default_value = "100")]
    pub option_multiplier: String,

    /// Contract id, required in manual mode
    #[arg(long)]
    pub conid: Option<i64>,

    #[arg(long, default_value = "")]
    pub option_trading_class: String,

    #[arg(long, default_value = "")]
    pub exchange: String,

    #[arg(long, default_value = "")]
    pub primary_exchange: String,

    #[arg(long, default_value = "")]
    pub option_exchange: String,

    /// Gateway port for auto lookups
    #[arg(long, default_value_t = 4001)]
    pub port: u16,

    /// Client id for the lookup connection
    #[arg(long, default_value_t = 101)]
    pub client_id: i32,

    /// Accept looked-up values and skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Config file path
    #[arg(short, long, default_value = "config/Config.toml")]
    pub config: String,
}

impl AddUnderlyingArgs {
    /// The row to insert, with `con_id` filled in and text normalized.
    #[must_use]
    pub fn to_new_underlying(&self, con_id: i64) -> NewUnderlying {
        NewUnderlying {
            con_id,
            symbol: self.symbol.clone(),
            sec_type: self.sec_type.clone(),
            currency: self.currency.clone(),
            option_style: self.option_style.clone(),
            option_settlement: self.option_settlement.clone(),
            option_multiplier: self.option_multiplier.clone(),
            option_trading_class: Some(self.option_trading_class.clone()),
            is_1256_contract: self.is_1256_contract == 1,
            exchange: self.exchange.clone(),
            option_exchange: Some(self.option_exchange.clone()),
            primary_exchange: Some(self.primary_exchange.clone()),
        }
        .normalized()
    }
}

/// Qualifies the underlying through `broker`. Stocks route through SMART,
/// indexes through their listing exchange.
///
/// # Errors
///
/// Returns an error if the contract cannot be qualified or comes back with a
/// different symbol or currency.
pub async fn lookup(broker: &dyn Broker, underlying: &NewUnderlying) -> Result<UnderlyingContract> {
    let sec_type: SecType = underlying.sec_type.parse()?;
    let exchange = match sec_type {
        SecType::Stock => "SMART".to_string(),
        SecType::Index => underlying.exchange.clone(),
    };
    let lookup_key = UnderlyingContract {
        con_id: 0,
        symbol: underlying.symbol.clone(),
        sec_type,
        currency: underlying.currency.clone(),
        exchange,
        primary_exchange: underlying.primary_exchange.clone(),
    };

    let found = broker
        .qualify_underlying(&lookup_key)
        .await
        .with_context(|| format!("Failed to qualify {}", underlying.symbol))?;
    ensure!(found.con_id != 0, "{} qualified without a conid", underlying.symbol);
    ensure!(
        found.symbol == underlying.symbol,
        "Gateway returned symbol {} for {}",
        found.symbol,
        underlying.symbol
    );
    ensure!(
        found.currency == underlying.currency,
        "Gateway returned currency {} for {}",
        found.currency,
        underlying.currency
    );
    Ok(found)
}

/// Renders the row for the confirmation prompt.
#[must_use]
pub fn confirmation_table(underlying: &NewUnderlying) -> String {
    let optional = |value: &Option<String>| value.clone().unwrap_or_default();
    let rows = [
        ("conid", underlying.con_id.to_string()),
        ("symbol", underlying.symbol.clone()),
        ("sec_type", underlying.sec_type.clone()),
        ("currency", underlying.currency.clone()),
        ("option_style", underlying.option_style.clone()),
        ("option_settlement", underlying.option_settlement.clone()),
        ("option_multiplier", underlying.option_multiplier.clone()),
        ("option_trading_class", optional(&underlying.option_trading_class)),
        ("is_1256_contract", underlying.is_1256_contract.to_string()),
        ("exchange", underlying.exchange.clone()),
        ("option_exchange", optional(&underlying.option_exchange)),
        ("primary_exchange", optional(&underlying.primary_exchange)),
    ];

    let mut table = String::new();
    for (field, value) in rows {
        table.push_str(&format!("{field:<22}{value}\n"));
    }
    table
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/n]: ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

#[cfg(feature = "ib")]
async fn connect_for_lookup(args: &AddUnderlyingArgs) -> Result<Box<dyn Broker>> {
    use straddle_ib::{IBConfig, IbBroker};

    let config = IBConfig {
        port: args.port,
        client_id: args.client_id,
        ..IBConfig::default()
    };
    Ok(Box::new(IbBroker::connect(config).await?))
}

#[cfg(not(feature = "ib"))]
async fn connect_for_lookup(args: &AddUnderlyingArgs) -> Result<Box<dyn Broker>> {
    bail!(
        "Auto mode needs the `ib` feature to reach the gateway on port {}; use --mode manual",
        args.port
    )
}

pub async fn run_add_underlying(args: AddUnderlyingArgs) -> Result<()> {
    let mut underlying = args.to_new_underlying(args.conid.unwrap_or_default());

    match args.mode {
        LookupMode::Manual => {
            if args.conid.is_none() {
                bail!("No conid supplied in manual mode");
            }
        }
        LookupMode::Auto => {
            let broker = connect_for_lookup(&args).await?;
            let found = lookup(broker.as_ref(), &underlying).await?;
            underlying.con_id = found.con_id;
            if args.yes || confirm(&format!("Use returned exchange `{}`?", found.exchange))? {
                underlying.exchange = found.exchange;
            }
            if let Some(primary) = found.primary_exchange {
                if args.yes || confirm(&format!("Use returned primary exchange `{primary}`?"))? {
                    underlying.primary_exchange = Some(primary);
                }
            }
        }
    }

    underlying.validate()?;
    println!("{}", confirmation_table(&underlying));
    if !args.yes && !confirm("Confirm that all the above are correct")? {
        println!("Log aborted.");
        return Ok(());
    }

    let config = ConfigLoader::load(&args.config)?;
    let db = Database::connect(&config.database.url, config.database.max_connections).await?;
    let inserted = db.repos().underlyings.log_underlying(&underlying).await?;
    db.close().await;

    if inserted {
        info!(symbol = underlying.symbol, con_id = underlying.con_id, "Underlying added");
        println!("Added {}.", underlying.symbol);
    } else {
        println!("{} (or conid {}) is already registered.", underlying.symbol, underlying.con_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use rust_decimal_macros::dec;
    use straddle_ib::{PaperBroker, Quote};

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: AddUnderlyingArgs,
    }

    fn parse(extra: &[&str]) -> AddUnderlyingArgs {
        let mut argv = vec![
            "straddle",
            "--symbol",
            "aapl",
            "--sec-type",
            "stk",
            "--option-style",
            "american",
            "--is-1256-contract",
            "0",
            "--option-settlement",
            "physical",
            "--exchange",
            "nasdaq",
        ];
        argv.extend_from_slice(extra);
        Harness::parse_from(argv).args
    }

    #[test]
    fn flags_build_a_normalized_row() {
        let args = parse(&["--mode", "MANUAL", "--conid", "265598"]);
        assert_eq!(args.mode, LookupMode::Manual);

        let row = args.to_new_underlying(265_598);
        assert_eq!(row.symbol, "AAPL");
        assert_eq!(row.sec_type, "STK");
        assert_eq!(row.option_style, "AMERICAN");
        assert_eq!(row.option_multiplier, "100");
        assert_eq!(row.option_trading_class, None);
        assert!(!row.is_1256_contract);
        assert!(row.validate().is_ok());
    }

    #[test]
    fn section_1256_flag_is_zero_or_one() {
        let result = Harness::try_parse_from([
            "straddle",
            "--mode",
            "manual",
            "--symbol",
            "SPX",
            "--sec-type",
            "IND",
            "--option-style",
            "european",
            "--is-1256-contract",
            "2",
            "--option-settlement",
            "cash",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn table_lists_every_column() {
        let row = parse(&["--mode", "manual", "--conid", "265598"]).to_new_underlying(265_598);
        let table = confirmation_table(&row);
        assert_eq!(table.lines().count(), 12);
        assert!(table.contains("symbol                AAPL"));
        assert!(table.contains("conid                 265598"));
    }

    #[tokio::test]
    async fn auto_lookup_takes_the_gateway_conid() {
        let broker = PaperBroker::new("DU1", dec!(1000));
        broker.add_underlying(
            UnderlyingContract {
                con_id: 265_598,
                symbol: "AAPL".to_string(),
                sec_type: SecType::Stock,
                currency: "USD".to_string(),
                exchange: "SMART".to_string(),
                primary_exchange: Some("NASDAQ".to_string()),
            },
            Quote::default(),
        );

        let row = parse(&["--mode", "auto"]).to_new_underlying(0);
        let found = lookup(&broker, &row).await.unwrap();
        assert_eq!(found.con_id, 265_598);
        assert_eq!(found.primary_exchange.as_deref(), Some("NASDAQ"));

        let mut euro = row.clone();
        euro.currency = "EUR".to_string();
        assert!(lookup(&broker, &euro).await.is_err());

        let mut unknown = row;
        unknown.symbol = "MSFT".to_string();
        assert!(lookup(&broker, &unknown).await.is_err());
    }
}
