//! Positions opened by this session.
//!
//! Broker position reports carry no timestamps and aggregate every lot of a
//! contract, so the positions a trade opened are backed out by diffing a
//! snapshot taken before the orders against one taken after, then checked
//! against the session's own trade log.

use std::collections::HashMap;

use anyhow::{Context, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use straddle_data::PositionRecord;
use straddle_ib::{BrokerPosition, OptionRight, OptionsContract, Quote};
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub contract: OptionsContract,
    /// Contracts, signed.
    pub quantity: i64,
    /// Average cost per share, comparable to a quoted price.
    pub avg_price: Decimal,
    pub quote: Quote,
    pub bsm_price: Option<f64>,
    pub sell_price: Option<Decimal>,
}

impl Position {
    #[must_use]
    pub fn from_broker(position: &BrokerPosition) -> Self {
        Self {
            symbol: position.contract.symbol.clone(),
            contract: position.contract.clone(),
            quantity: position.quantity,
            avg_price: position.avg_price(),
            quote: Quote::default(),
            bsm_price: None,
            sell_price: None,
        }
    }

    /// # Errors
    ///
    /// Returns an error if the row's right, strike or multiplier do not parse.
    pub fn from_db(row: &PositionRecord) -> Result<Self> {
        let right: OptionRight = row.right.parse()?;
        let strike = Decimal::from_f64(row.strike)
            .with_context(|| format!("Invalid strike {} for {}", row.strike, row.symbol))?
            .normalize();
        let multiplier = row
            .multiplier
            .parse::<Decimal>()
            .with_context(|| format!("Invalid multiplier `{}` for {}", row.multiplier, row.symbol))?;

        let mut contract = OptionsContract::new(&row.symbol, &row.expiration, strike, right);
        contract.con_id = row.con_id;
        contract.multiplier = multiplier;
        contract.trading_class.clone_from(&row.trading_class);
        if let Some(exchange) = &row.exchange {
            contract.exchange.clone_from(exchange);
        }

        Ok(Self {
            symbol: row.symbol.clone(),
            contract,
            quantity: row.quantity,
            avg_price: Decimal::from_f64(row.avg_price).unwrap_or_default(),
            quote: Quote::default(),
            bsm_price: None,
            sell_price: None,
        })
    }

    #[must_use]
    pub fn con_id(&self) -> i64 {
        self.contract.con_id
    }
}

/// Backs the positions this session opened out of two broker snapshots.
///
/// Contracts absent from `preexisting` are new. Unchanged ones are ignored.
/// An increased position yields only the added lot, with its average cost
/// solved from the two aggregates. A decreased position is returned whole.
#[must_use]
pub fn remove_preexisting(
    current: Vec<BrokerPosition>,
    preexisting: &[BrokerPosition],
) -> Vec<BrokerPosition> {
    let before: HashMap<i64, &BrokerPosition> =
        preexisting.iter().map(|p| (p.contract.con_id, p)).collect();

    current
        .into_iter()
        .filter_map(|position| {
            let Some(old) = before.get(&position.contract.con_id) else {
                return Some(position);
            };
            if position.quantity == old.quantity {
                return None;
            }
            if position.quantity < old.quantity {
                return Some(position);
            }

            let added = position.quantity - old.quantity;
            let total_cost = position.avg_cost * Decimal::from(position.quantity);
            let old_cost = old.avg_cost * Decimal::from(old.quantity);
            Some(BrokerPosition {
                quantity: added,
                avg_cost: (total_cost - old_cost) / Decimal::from(added),
                ..position
            })
        })
        .collect()
}

/// Splits raw records into `(broker, db)` positions for `symbol`. DB rows are
/// already scoped to the symbol by their query.
///
/// # Errors
///
/// Returns an error if a DB row cannot be converted.
pub fn build_positions(
    symbol: &str,
    broker_positions: &[BrokerPosition],
    db_rows: &[PositionRecord],
) -> Result<(Vec<Position>, Vec<Position>)> {
    let broker = broker_positions
        .iter()
        .filter(|p| p.contract.symbol.eq_ignore_ascii_case(symbol))
        .map(Position::from_broker)
        .collect();
    let db = db_rows.iter().map(Position::from_db).collect::<Result<Vec<_>>>()?;
    Ok((broker, db))
}

/// The session's positions in `symbol`. Broker records win; a quantity that
/// disagrees with the trade log is logged.
///
/// # Errors
///
/// Returns an error if a DB row cannot be converted.
pub fn validate_positions(
    symbol: &str,
    broker_positions: &[BrokerPosition],
    db_rows: &[PositionRecord],
) -> Result<Vec<Position>> {
    let (broker, db) = build_positions(symbol, broker_positions, db_rows)?;
    let logged: HashMap<i64, i64> = db.iter().map(|p| (p.con_id(), p.quantity)).collect();

    for position in &broker {
        match logged.get(&position.con_id()) {
            Some(quantity) if *quantity == position.quantity => {}
            Some(quantity) => warn!(
                symbol,
                contract = position.contract.display_name(),
                broker_quantity = position.quantity,
                logged_quantity = quantity,
                "Broker position disagrees with trade log"
            ),
            None => warn!(
                symbol,
                contract = position.contract.display_name(),
                broker_quantity = position.quantity,
                "Broker position missing from trade log"
            ),
        }
    }

    Ok(broker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn contract(con_id: i64, strike: Decimal, right: OptionRight) -> OptionsContract {
        let mut contract = OptionsContract::new("AAPL", "20211126", strike, right);
        contract.con_id = con_id;
        contract
    }

    fn held(con_id: i64, quantity: i64, avg_cost: Decimal) -> BrokerPosition {
        BrokerPosition {
            account: "DU1".to_string(),
            contract: contract(con_id, dec!(160), OptionRight::Call),
            quantity,
            avg_cost,
        }
    }

    fn row(con_id: i64, quantity: i64) -> PositionRecord {
        PositionRecord {
            quantity,
            avg_price: 2.15,
            con_id,
            strike: 160.0,
            right: "C".to_string(),
            exchange: Some("SMART".to_string()),
            expiration: "20211126".to_string(),
            symbol: "AAPL".to_string(),
            multiplier: "100".to_string(),
            trading_class: Some("AAPL".to_string()),
        }
    }

    #[test]
    fn new_contracts_are_kept_and_unchanged_dropped() {
        let before = vec![held(1, 5, dec!(200))];
        let after = vec![held(1, 5, dec!(200)), held(2, 3, dec!(150))];

        let opened = remove_preexisting(after, &before);
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].contract.con_id, 2);
        assert_eq!(opened[0].quantity, 3);
    }

    #[test]
    fn increased_position_yields_added_lot_cost() {
        // 10 @ 200 held, 5 more bought @ 260 -> 15 @ 220 aggregate
        let before = vec![held(1, 10, dec!(200))];
        let after = vec![held(1, 15, dec!(220))];

        let opened = remove_preexisting(after, &before);
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].quantity, 5);
        assert_eq!(opened[0].avg_cost, dec!(260));
        assert_eq!(opened[0].avg_price(), dec!(2.6));
    }

    #[test]
    fn decreased_position_is_returned_whole() {
        let before = vec![held(1, 10, dec!(200))];
        let after = vec![held(1, 4, dec!(200))];

        let opened = remove_preexisting(after, &before);
        assert_eq!(opened[0].quantity, 4);
    }

    #[test]
    fn db_rows_convert_to_positions() {
        let position = Position::from_db(&row(7, 2)).unwrap();
        assert_eq!(position.con_id(), 7);
        assert_eq!(position.contract.strike, dec!(160));
        assert_eq!(position.contract.right, OptionRight::Call);
        assert_eq!(position.contract.multiplier, dec!(100));
        assert_eq!(position.avg_price, dec!(2.15));

        let mut bad = row(7, 2);
        bad.right = "X".to_string();
        assert!(Position::from_db(&bad).is_err());
    }

    #[test]
    fn broker_positions_are_filtered_by_symbol() {
        let mut other = held(9, 1, dec!(100));
        other.contract.symbol = "SPY".to_string();
        let broker = vec![held(1, 2, dec!(215)), other];

        let positions = validate_positions("AAPL", &broker, &[row(1, 1)]).unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 2);
        assert_eq!(positions[0].avg_price, dec!(2.15));
    }
}
