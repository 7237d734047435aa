//! Database maintenance and inspection commands.

use anyhow::{bail, Result};
use chrono::{NaiveDate, NaiveDateTime};
use clap::Args;
use straddle_core::{market_now, ConfigLoader};
use straddle_data::{Database, PositionRecord, UnderlyingRecord};

/// Where to find the database.
#[derive(Args, Debug, Clone)]
pub struct DatabaseArgs {
    /// Database URL, e.g. `sqlite://db/alpha.db` (overrides `database.url`)
    #[arg(long)]
    pub database: Option<String>,

    /// Config file path
    #[arg(short, long, default_value = "config/Config.toml")]
    pub config: String,
}

impl DatabaseArgs {
    async fn open(&self) -> Result<Database> {
        let config = ConfigLoader::load(&self.config)?;
        let url = self.database.as_deref().unwrap_or(&config.database.url);
        Database::connect(url, config.database.max_connections).await
    }
}

/// Arguments for the positions command.
#[derive(Args, Debug, Clone)]
pub struct PositionsArgs {
    /// Only count trades after this date (`YYYY-MM-DD`) or time
    /// (`YYYY-MM-DDTHH:MM:SS`); defaults to the start of today
    #[arg(long)]
    pub since: Option<String>,

    #[command(flatten)]
    pub db: DatabaseArgs,
}

/// Arguments for the clear-trades command.
#[derive(Args, Debug, Clone)]
pub struct ClearTradesArgs {
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    #[command(flatten)]
    pub db: DatabaseArgs,
}

/// Parses a `--since` value in New York local time.
///
/// # Errors
///
/// Returns an error if the value is neither a date nor a datetime.
pub fn parse_since(value: &str) -> Result<NaiveDateTime> {
    if let Ok(time) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Ok(time);
    }
    match NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        Ok(date) => Ok(date.and_time(chrono::NaiveTime::MIN)),
        Err(_) => bail!("Expected YYYY-MM-DD or YYYY-MM-DDTHH:MM:SS, got `{value}`"),
    }
}

fn format_underlying(u: &UnderlyingRecord) -> String {
    format!(
        "{:<4} {:<8} {:<10} {:<4} {:<4} {:<9} {:<9} {:<4} {:<6} {}",
        u.id,
        u.symbol,
        u.con_id,
        u.sec_type,
        u.currency,
        u.option_style,
        u.option_settlement,
        u.option_multiplier,
        if u.is_1256_contract { "1256" } else { "-" },
        u.exchange,
    )
}

fn format_position(p: &PositionRecord) -> String {
    format!(
        "{:<8} {:<9} {:>9.2} {:<2} {:>6} {:>9.4} {:>10}",
        p.symbol, p.expiration, p.strike, p.right, p.quantity, p.avg_price, p.con_id,
    )
}

pub async fn run_init_db(args: DatabaseArgs) -> Result<()> {
    let db = args.open().await?;
    let underlyings = db.repos().underlyings.all_underlyings().await?;
    db.close().await;
    println!("Database ready ({} underlyings registered).", underlyings.len());
    Ok(())
}

pub async fn run_list_underlyings(args: DatabaseArgs) -> Result<()> {
    let db = args.open().await?;
    let underlyings = db.repos().underlyings.all_underlyings().await?;
    db.close().await;

    if underlyings.is_empty() {
        println!("No underlyings registered.");
        return Ok(());
    }
    println!(
        "{:<4} {:<8} {:<10} {:<4} {:<4} {:<9} {:<9} {:<4} {:<6} EXCHANGE",
        "ID", "SYMBOL", "CONID", "TYPE", "CCY", "STYLE", "SETTLE", "MULT", "1256"
    );
    for underlying in &underlyings {
        println!("{}", format_underlying(underlying));
    }
    Ok(())
}

pub async fn run_positions(args: PositionsArgs) -> Result<()> {
    let since = match &args.since {
        Some(value) => parse_since(value)?,
        None => market_now().date().and_time(chrono::NaiveTime::MIN),
    };

    let db = args.db.open().await?;
    let positions = db.repos().trades.all_positions(since).await?;
    db.close().await;

    if positions.is_empty() {
        println!("No open positions since {since}.");
        return Ok(());
    }
    println!(
        "{:<8} {:<9} {:>9} {:<2} {:>6} {:>9} {:>10}",
        "SYMBOL", "EXPIRY", "STRIKE", "R", "QTY", "AVG", "CONID"
    );
    for position in &positions {
        println!("{}", format_position(position));
    }
    Ok(())
}

pub async fn run_clear_trades(args: ClearTradesArgs) -> Result<()> {
    if !args.yes {
        bail!("Refusing to delete the trade log without --yes");
    }
    let db = args.db.open().await?;
    let deleted = db.repos().trades.delete_all_trades().await?;
    db.close().await;
    tracing::warn!(deleted, "Trade log cleared");
    println!("Deleted {deleted} trades.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn since_accepts_dates_and_times() {
        let date = parse_since("2021-11-24").unwrap();
        assert_eq!(date.to_string(), "2021-11-24 00:00:00");

        let time = parse_since("2021-11-24T09:30:00").unwrap();
        assert_eq!(time.to_string(), "2021-11-24 09:30:00");

        assert!(parse_since("11/24/2021").is_err());
    }

    #[test]
    fn positions_print_one_line_each() {
        let position = PositionRecord {
            quantity: -3,
            avg_price: 2.1,
            con_id: 1_000_001,
            strike: 160.0,
            right: "P".to_string(),
            exchange: Some("SMART".to_string()),
            expiration: "20211126".to_string(),
            symbol: "AAPL".to_string(),
            multiplier: "100".to_string(),
            trading_class: None,
        };
        let line = format_position(&position);
        assert!(line.starts_with("AAPL     20211126"));
        assert!(line.contains("160.00 P"));
        assert!(line.contains("    -3"));
    }

    #[tokio::test]
    async fn init_db_creates_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("alpha.db");
        let args = DatabaseArgs {
            database: Some(format!("sqlite://{}", path.display())),
            config: dir.path().join("missing.toml").display().to_string(),
        };
        run_init_db(args).await.unwrap();
        assert!(path.exists());
    }
}
