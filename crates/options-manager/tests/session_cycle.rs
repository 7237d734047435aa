//! A full session against the simulated broker: the entry signal fires on
//! the first tick of the entry window, the straddle is bought, held for the
//! holding period, sold, and the session shuts down flat at the close.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use straddle_core::{pricing, CalendarConfig, EarlyClose, MarketCalendar, StrategyConfig};
use straddle_data::{Database, NewUnderlying};
use straddle_ib::{
    Broker, OptionChainParams, OptionsContract, PaperBroker, Quote, SecType, UnderlyingContract,
};
use straddle_options_manager::validate::model_price;
use straddle_options_manager::{Clock, Session, SimulatedClock, TradingContext};

const CON_ID: i64 = 265_598;
const SPOT: Decimal = dec!(162.5);

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 11, 24).unwrap()
}

fn at(hour: u32, minute: u32, second: u32) -> NaiveDateTime {
    day().and_hms_opt(hour, minute, second).unwrap()
}

fn aapl() -> NewUnderlying {
    NewUnderlying {
        con_id: CON_ID,
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
    }
}

fn broker(clock: Arc<SimulatedClock>) -> (Arc<PaperBroker>, Vec<OptionsContract>) {
    let broker = Arc::new(PaperBroker::new("DU1", dec!(100000)).with_clock(move || clock.now()));
    broker.add_underlying(
        UnderlyingContract {
            con_id: CON_ID,
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
            underlying_con_id: CON_ID,
            trading_class: "AAPL".to_string(),
            multiplier: "100".to_string(),
            expirations: vec!["20211126".to_string()],
            strikes: (150..=175).step_by(5).map(Decimal::from).collect(),
        },
    );
    (broker, chain)
}

/// Fourteen one-minute bars up to 09:44. The 09:44 bar is the quietest and
/// brackets spot, so ticks logged at spot leave it unchanged.
async fn seed_history(db: &Database, underlying_id: i64) {
    let spot = SPOT.to_f64().unwrap();
    for minute in 31..=44 {
        let range = if minute == 44 { 0.0008 } else { 0.0012 };
        let low = spot * (1.0 - range / 2.0);
        let high = low * (1.0 + range);
        let market_data = &db.repos().market_data;
        market_data
            .log_underlying_data(underlying_id, Some(low), at(9, minute, 10))
            .await
            .unwrap();
        market_data
            .log_underlying_data(underlying_id, Some(high), at(9, minute, 40))
            .await
            .unwrap();
    }
}

/// Quotes the chain tight around the model value the session will see at
/// the start of the entry window.
async fn quote_chain(
    db: &Database,
    broker: &PaperBroker,
    chain: &[OptionsContract],
    underlying_id: i64,
    strategy: &StrategyConfig,
) {
    let entry = at(9, 45, 0);
    let sigma = db
        .repos()
        .market_data
        .sigma(underlying_id, entry, strategy.vol_lookback_minutes)
        .await
        .unwrap();
    let expiration = NaiveDate::from_ymd_opt(2021, 11, 26)
        .unwrap()
        .and_hms_opt(16, 0, 0)
        .unwrap();
    let tenor = pricing::tenor_years(expiration, entry).unwrap();

    for contract in chain {
        let model = model_price(contract, SPOT.to_f64().unwrap(), sigma, tenor, strategy.risk_free_rate);
        let model = Decimal::from_f64(model).unwrap();
        broker.set_quote(
            contract.con_id,
            Quote {
                bid: Some((model * dec!(0.99)).round_dp(2)),
                ask: Some((model * dec!(1.02)).round_dp(2)),
                bid_size: 50,
                ask_size: 50,
                bid_iv: Some(0.14),
                ask_iv: Some(0.15),
                ..Quote::default()
            },
        );
    }
}

#[tokio::test]
async fn straddle_is_bought_held_and_sold_within_one_session() {
    let db = Database::in_memory().await.unwrap();
    db.repos().underlyings.log_underlying(&aapl()).await.unwrap();
    let rows = db.repos().underlyings.all_underlyings().await.unwrap();
    let underlying_id = rows[0].id;

    let strategy = StrategyConfig {
        entry_cutoff_minutes: 15,
        holding_period_minutes: 10,
        close_buffer_minutes: 5,
        ..StrategyConfig::default()
    };
    let calendar = CalendarConfig {
        holidays: Vec::new(),
        early_closes: vec![EarlyClose {
            date: day(),
            close: NaiveTime::from_hms_opt(10, 5, 0).unwrap(),
        }],
    };

    let clock = Arc::new(SimulatedClock::starting_at(at(9, 44, 50)));
    let (broker, chain) = broker(clock.clone());
    seed_history(&db, underlying_id).await;
    quote_chain(&db, &broker, &chain, underlying_id, &strategy).await;

    let ctx = TradingContext {
        broker: broker.clone(),
        db: db.clone(),
        clock,
        calendar: Arc::new(MarketCalendar::new(&calendar)),
        strategy,
        account_num: "DU1".to_string(),
        session_start: at(9, 30, 0),
    };

    let mut session = Session::start(ctx.clone(), &rows).await.unwrap();
    assert_eq!(session.last_close(), at(10, 5, 0));
    session.run().await.unwrap();

    let market_data = &db.repos().market_data;
    assert!(market_data.buy_signal_count(underlying_id).await.unwrap() > 0);

    let trades = db.repos().trades.all_trades().await.unwrap();
    assert!(trades.iter().any(|t| t.quantity > 0), "nothing was bought");
    assert!(trades.iter().any(|t| t.quantity < 0), "nothing was sold");

    let mut net: HashMap<i64, i64> = HashMap::new();
    for trade in &trades {
        *net.entry(trade.option_id).or_default() += trade.quantity;
    }
    assert!(net.values().all(|q| *q == 0), "trade log not flat: {net:?}");

    let first_sale = trades
        .iter()
        .filter(|t| t.quantity < 0)
        .map(|t| t.time)
        .min()
        .unwrap();
    assert!(first_sale >= at(9, 45, 0) + ChronoDuration::minutes(10));

    assert!(broker.positions("DU1").await.unwrap().is_empty());
    assert_eq!(broker.open_lines(), 0);

    let fill_times: Vec<NaiveDateTime> = broker
        .orders()
        .iter()
        .flat_map(|o| o.fills.iter().map(|f| f.time))
        .collect();
    assert!(!fill_times.is_empty());
    assert!(fill_times.iter().all(|t| *t >= at(9, 45, 0) && *t <= at(10, 5, 0)));

    let ticks = market_data.underlying_ticks(underlying_id).await.unwrap();
    let last_tick = ticks.last().map(|(time, _)| *time).unwrap();
    assert!(last_tick < at(10, 5, 0));
    assert!(ctx.now() >= at(10, 5, 0));
}
