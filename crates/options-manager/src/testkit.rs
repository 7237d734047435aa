//! Paper-broker fixtures shared by the unit tests.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use straddle_core::{pricing, CalendarConfig, MarketCalendar, StrategyConfig};
use straddle_data::{Database, NewOption, NewUnderlying, UnderlyingRecord};
use straddle_ib::{
    Broker, OptionChainParams, OptionRight, PaperBroker, Quote, SecType, UnderlyingContract,
};

use crate::clock::{Clock, SimulatedClock};
use crate::context::TradingContext;
use crate::underlying::TrackedUnderlying;
use crate::validate;

pub const UNDERLYING_CON_ID: i64 = 265_598;
pub const EXPIRY: &str = "20211126";
pub const SPOT: Decimal = dec!(162.5);
const FIRST_OPTION_CON_ID: i64 = 1_000_000;

pub fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 11, 24).unwrap()
}

pub fn at(hour: u32, minute: u32) -> NaiveDateTime {
    day().and_hms_opt(hour, minute, 0).unwrap()
}

pub fn strikes() -> Vec<Decimal> {
    (150..=180).step_by(5).map(Decimal::from).collect()
}

/// Con id the paper broker hands the chain contract: calls then puts per
/// strike, in strike order.
pub fn con_id(strike: Decimal, right: OptionRight) -> i64 {
    let index = strikes().iter().position(|s| *s == strike).unwrap() as i64;
    let offset = match right {
        OptionRight::Call => 0,
        OptionRight::Put => 1,
    };
    FIRST_OPTION_CON_ID + index * 2 + offset
}

pub fn quote(bid: Decimal, ask: Decimal, size: i64) -> Quote {
    Quote {
        bid: Some(bid),
        ask: Some(ask),
        last: None,
        close: None,
        bid_size: size,
        ask_size: size,
        bid_iv: Some(0.14),
        ask_iv: Some(0.15),
    }
}

/// Registers a chain contract in the `Option` table and returns its con id.
pub async fn log_option(db: &Database, strike: Decimal, right: OptionRight) -> i64 {
    let underlying_id = db
        .repos()
        .underlyings
        .underlying_id("AAPL")
        .await
        .unwrap()
        .unwrap();
    let con_id = con_id(strike, right);
    db.repos()
        .options
        .log_options(
            underlying_id,
            &[NewOption {
                con_id,
                expiration: EXPIRY.to_string(),
                right: right.as_str().to_string(),
                strike: strike.to_f64().unwrap(),
                exchange: Some("SMART".to_string()),
            }],
        )
        .await;
    con_id
}

pub struct Harness {
    pub ctx: TradingContext,
    pub broker: Arc<PaperBroker>,
    pub db: Database,
    pub clock: Arc<SimulatedClock>,
}

/// AAPL at 162.50 with one weekly expiry quoted across the chain, on a
/// simulated clock starting at 10:00 that the broker stamps fills with.
pub async fn harness() -> Harness {
    let db = Database::in_memory().await.unwrap();
    let clock = Arc::new(SimulatedClock::starting_at(at(10, 0)));
    let fill_clock = clock.clone();
    let broker = Arc::new(PaperBroker::new("DU1", dec!(100000)).with_clock(move || fill_clock.now()));

    broker.add_underlying(
        UnderlyingContract {
            con_id: UNDERLYING_CON_ID,
            symbol: "AAPL".to_string(),
            sec_type: SecType::Stock,
            currency: "USD".to_string(),
            exchange: "SMART".to_string(),
            primary_exchange: Some("NASDAQ".to_string()),
        },
        Quote {
            last: Some(SPOT),
            bid: Some(dec!(162.49)),
            ask: Some(dec!(162.51)),
            bid_size: 100,
            ask_size: 100,
            ..Quote::default()
        },
    );
    let chain = broker.add_option_chain(
        "AAPL",
        OptionChainParams {
            exchange: "SMART".to_string(),
            underlying_con_id: UNDERLYING_CON_ID,
            trading_class: "AAPL".to_string(),
            multiplier: "100".to_string(),
            expirations: vec![EXPIRY.to_string()],
            strikes: strikes(),
        },
    );
    for contract in chain {
        broker.set_quote(contract.con_id, quote(dec!(2.00), dec!(2.10), 50));
    }

    let ctx = TradingContext {
        broker: broker.clone(),
        db: db.clone(),
        clock: clock.clone(),
        calendar: Arc::new(MarketCalendar::new(&CalendarConfig::default())),
        strategy: StrategyConfig::default(),
        account_num: "DU1".to_string(),
        session_start: at(9, 30),
    };

    Harness { ctx, broker, db, clock }
}

impl Harness {
    /// Adds AAPL to the `Underlying` table and returns its row.
    pub async fn row(&self) -> UnderlyingRecord {
        self.db
            .repos()
            .underlyings
            .log_underlying(&NewUnderlying {
                con_id: UNDERLYING_CON_ID,
                symbol: "AAPL".to_string(),
                sec_type: "STK".to_string(),
                currency: "USD".to_string(),
                option_style: "AMERICAN".to_string(),
                option_settlement: "PHYSICAL".to_string(),
                option_multiplier: "100".to_string(),
                option_trading_class: Some("AAPL".to_string()),
                is_1256_contract: false,
                exchange: "SMART".to_string(),
                option_exchange: Some("SMART".to_string()),
                primary_exchange: Some("NASDAQ".to_string()),
            })
            .await
            .unwrap();
        self.db
            .repos()
            .underlyings
            .all_underlyings()
            .await
            .unwrap()
            .into_iter()
            .find(|u| u.symbol == "AAPL")
            .unwrap()
    }

    pub async fn underlying(&self, row: &UnderlyingRecord) -> TrackedUnderlying {
        TrackedUnderlying::initialize(&self.ctx, row, day()).await.unwrap()
    }

    /// Logs a low and a high print for each of the last fourteen minutes.
    /// The newest bar is the quietest, so realized vol is cooling off.
    pub async fn seed_ticks(&self, underlying_id: i64) {
        let now = self.ctx.now();
        let spot = SPOT.to_f64().unwrap();
        let market_data = &self.db.repos().market_data;

        for minutes_ago in (1..=14).rev() {
            let bar = now - ChronoDuration::minutes(minutes_ago);
            let range = if minutes_ago == 1 { 0.0008 } else { 0.0012 };
            let low = spot * (1.0 - range / 2.0);
            let high = low * (1.0 + range);
            market_data
                .log_underlying_data(underlying_id, Some(low), bar + ChronoDuration::seconds(10))
                .await
                .unwrap();
            market_data
                .log_underlying_data(underlying_id, Some(high), bar + ChronoDuration::seconds(40))
                .await
                .unwrap();
        }
    }

    /// Quotes every tracked option at its model value: the ask marked up
    /// by `markup`, the bid three percent under model.
    pub async fn quote_chain_at_model(&self, underlying: &TrackedUnderlying, markup: Decimal) {
        let now = self.ctx.now();
        let sigma = self
            .db
            .repos()
            .market_data
            .sigma(underlying.db_id, now, self.ctx.strategy.vol_lookback_minutes)
            .await
            .unwrap();
        let tenor = pricing::tenor_years(underlying.options_expiration, now).unwrap();
        let spot = SPOT.to_f64().unwrap();

        for option in underlying.options() {
            let model = validate::model_price(
                &option.contract,
                spot,
                sigma,
                tenor,
                self.ctx.strategy.risk_free_rate,
            );
            let model = Decimal::from_f64(model).unwrap();
            let ask = (model * markup).round_dp(2);
            let bid = (model * dec!(0.97)).round_dp(2);
            self.broker.set_quote(option.contract.con_id, quote(bid, ask, 50));
        }
    }

    pub async fn open_positions(&self) -> usize {
        self.broker.positions("DU1").await.unwrap().len()
    }
}
