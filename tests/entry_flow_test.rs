mod common;

use std::time::Duration;

use bybit_signal_trader::strategy::config::EngineConfig;
use bybit_signal_trader::strategy::errors::EngineError;
use bybit_signal_trader::strategy::paper_trading_backend::{PaperEvent, PaperOp};
use bybit_signal_trader::strategy::registry::PositionKey;
use bybit_signal_trader::strategy::types::{OrderSide, PositionSide, SignalOutcome};
use common::{approx, executor, paper, BTC, ETH};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_long_entry_places_both_protective_layers() {
    let paper = paper().await;
    let engine = executor(&paper, EngineConfig::default());

    let outcome = engine.handle_signal("buy", BTC).await.unwrap();
    let SignalOutcome::Opened(summary) = outcome else {
        panic!("expected an opened position, got {:?}", outcome);
    };

    assert_eq!(summary.side, PositionSide::Long);
    assert!(approx(summary.quantity, 0.02));
    assert!(approx(summary.entry_price, 50_000.0));
    assert!(approx(summary.take_profit, 50_303.0));
    assert!(approx(summary.stop_loss, 49_897.0));
    assert!(summary.trailing_monitor);

    let markets = paper.market_orders().await;
    assert_eq!(markets.len(), 1);
    assert_eq!(markets[0].side, OrderSide::Buy);
    assert_eq!(markets[0].qty, "0.020");
    assert_eq!(markets[0].position_idx, 1);
    assert!(!markets[0].reduce_only);
    assert!(markets[0].order_link_id.starts_with("entry_"));

    let limits = paper.limit_orders().await;
    assert_eq!(limits.len(), 2);
    for order in &limits {
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.position_idx, 1);
        assert_eq!(order.qty, "0.020");
        assert!(order.reduce_only);
    }
    assert!(limits[0].order_link_id.starts_with("tp_"));
    assert!(limits[1].order_link_id.starts_with("sl_"));
    assert!(approx(limits[0].price.parse::<f64>().unwrap(), 50_303.0));
    assert!(approx(limits[1].price.parse::<f64>().unwrap(), 49_897.0));

    let (tp, sl) = paper.native_stop(BTC, PositionSide::Long).await.unwrap();
    assert!(approx(tp.unwrap().parse::<f64>().unwrap(), 50_303.0));
    assert!(approx(sl.unwrap().parse::<f64>().unwrap(), 49_897.0));

    assert!(engine.registry().is_managed(BTC, PositionSide::Long));
}

#[tokio::test(start_paused = true)]
async fn test_short_entry_mirrors_exit_prices() {
    let paper = paper().await;
    let engine = executor(&paper, EngineConfig::default());

    let outcome = engine.handle_signal("sell", ETH).await.unwrap();
    let SignalOutcome::Opened(summary) = outcome else {
        panic!("expected an opened position, got {:?}", outcome);
    };

    assert_eq!(summary.side, PositionSide::Short);
    assert!(approx(summary.take_profit, 99.41));
    // 100.194 is inside the 20-tick band and gets pushed out to 100.20.
    assert!(approx(summary.stop_loss, 100.2));

    let limits = paper.limit_orders().await;
    assert_eq!(limits.len(), 2);
    assert!(limits.iter().all(|o| o.side == OrderSide::Buy && o.position_idx == 2));
}

#[tokio::test(start_paused = true)]
async fn test_perpetual_suffix_is_stripped() {
    let paper = paper().await;
    let engine = executor(&paper, EngineConfig::default());

    engine.handle_signal("BUY", "btcusdt.P").await.unwrap();

    let markets = paper.market_orders().await;
    assert_eq!(markets[0].symbol, BTC);
    assert!(paper.position(BTC, PositionSide::Long).await > 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_same_side_signal_is_idempotent() {
    let paper = paper().await;
    let engine = executor(&paper, EngineConfig::default());

    engine.handle_signal("buy", BTC).await.unwrap();
    let second = engine.handle_signal("buy", BTC).await.unwrap();

    assert_eq!(second, SignalOutcome::AlreadyOpen);
    assert_eq!(paper.market_orders().await.len(), 1);
    assert_eq!(paper.limit_orders().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_existing_position_blocks_entry() {
    let paper = paper().await;
    paper.set_position(BTC, PositionSide::Long, 0.5, 48_000.0).await;
    let engine = executor(&paper, EngineConfig::default());

    let outcome = engine.handle_signal("buy", BTC).await.unwrap();

    assert_eq!(outcome, SignalOutcome::AlreadyOpen);
    assert!(paper.market_orders().await.is_empty());
    assert!(paper.limit_orders().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_opposite_position_is_flattened_first() {
    let paper = paper().await;
    paper.set_position(BTC, PositionSide::Short, 0.05, 51_000.0).await;
    let engine = executor(&paper, EngineConfig::default());

    let outcome = engine.handle_signal("buy", BTC).await.unwrap();
    assert!(matches!(outcome, SignalOutcome::Opened(_)));

    let markets = paper.market_orders().await;
    assert_eq!(markets.len(), 2);

    let close = &markets[0];
    assert!(close.reduce_only);
    assert_eq!(close.side, OrderSide::Buy);
    assert_eq!(close.position_idx, 2);
    assert_eq!(close.qty, "0.050");
    assert!(close.order_link_id.starts_with("close_"));

    assert!(!markets[1].reduce_only);
    assert_eq!(markets[1].position_idx, 1);
    assert_eq!(paper.position(BTC, PositionSide::Short).await, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_opposite_close_gives_up_after_retries() {
    let paper = paper().await;
    paper.set_position(BTC, PositionSide::Short, 5.0, 51_000.0).await;
    paper.set_honor_reduce_only(false).await;
    let engine = executor(&paper, EngineConfig::default());

    let start = Instant::now();
    let err = engine.handle_signal("buy", BTC).await.unwrap_err();

    match &err {
        EngineError::OppositeCloseTimeout { symbol, attempts } => {
            assert_eq!(symbol, BTC);
            assert_eq!(*attempts, 3);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(err.reason(), "opposite_close_timeout");
    assert!(start.elapsed() >= Duration::from_secs(15));

    let markets = paper.market_orders().await;
    assert_eq!(markets.len(), 3);
    assert!(markets.iter().all(|o| o.reduce_only && o.position_idx == 2 && o.qty == "5.000"));
    assert!(paper.limit_orders().await.is_empty());
    assert_eq!(engine.registry().active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unfilled_entry_times_out_without_protection() {
    let paper = paper().await;
    paper.set_fill_market_orders(false).await;
    let engine = executor(&paper, EngineConfig::default());

    let start = Instant::now();
    let err = engine.handle_signal("buy", BTC).await.unwrap_err();

    assert!(matches!(err, EngineError::FillTimeout { .. }));
    assert!(start.elapsed() >= Duration::from_secs(10));
    assert_eq!(paper.market_orders().await.len(), 1);
    assert!(paper.limit_orders().await.is_empty());
    assert!(paper.native_stop(BTC, PositionSide::Long).await.is_none());
    assert_eq!(engine.registry().active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_entry_price_aborts_before_protection() {
    let paper = paper().await;
    let config = EngineConfig {
        min_entry_price: 1e9,
        ..EngineConfig::default()
    };
    let engine = executor(&paper, config);

    let err = engine.handle_signal("buy", BTC).await.unwrap_err();

    assert!(matches!(err, EngineError::NoEntryPrice { .. }));
    assert_eq!(err.status_code(), 500);
    assert!(paper.limit_orders().await.is_empty());
    assert_eq!(engine.registry().active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_entry_price_falls_back_to_last_price() {
    let paper = paper().await;
    paper.set_report_entry_price(false).await;
    let engine = executor(&paper, EngineConfig::default());

    let SignalOutcome::Opened(summary) = engine.handle_signal("buy", BTC).await.unwrap() else {
        panic!("expected an opened position");
    };
    assert!(approx(summary.entry_price, 50_000.0));
}

#[tokio::test(start_paused = true)]
async fn test_zero_balance_skips_without_writes() {
    let paper = paper().await;
    paper.set_balance(0.0).await;
    let engine = executor(&paper, EngineConfig::default());

    let outcome = engine.handle_signal("buy", BTC).await.unwrap();

    assert!(matches!(outcome, SignalOutcome::Skipped { .. }));
    assert!(paper.journal().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_input_makes_no_remote_calls() {
    let paper = paper().await;
    let engine = executor(&paper, EngineConfig::default());

    let err = engine.handle_signal("hold", BTC).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
    assert_eq!(err.status_code(), 400);

    let err = engine.handle_signal("buy", "  ").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    assert!(paper.journal().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_remote_failure_surfaces_as_remote_error() {
    let paper = paper().await;
    paper.fail_next(PaperOp::GetBalance, 1).await;
    let engine = executor(&paper, EngineConfig::default());

    let err = engine.handle_signal("buy", BTC).await.unwrap_err();

    assert!(matches!(err, EngineError::Remote(_)));
    assert_eq!(err.reason(), "remote_error");
    assert!(paper.journal().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_protective_layers_fail_independently() {
    let paper = paper().await;
    paper.fail_next(PaperOp::SubmitLimitOrder, 2).await;
    let engine = executor(&paper, EngineConfig::default());

    let SignalOutcome::Opened(summary) = engine.handle_signal("buy", BTC).await.unwrap() else {
        panic!("expected an opened position");
    };

    assert!(paper.limit_orders().await.is_empty());
    assert!(paper.native_stop(BTC, PositionSide::Long).await.is_some());

    assert_eq!(summary.protection.take_profit_order, None);
    assert_eq!(summary.protection.stop_loss_order, None);
    assert!(summary.protection.native_stop);
    assert!(!summary.protection.is_unprotected());
}

#[tokio::test(start_paused = true)]
async fn test_unprotected_position_is_reported() {
    let paper = paper().await;
    paper.fail_next(PaperOp::SubmitLimitOrder, 2).await;
    paper.fail_next(PaperOp::SetNativeStop, 1).await;
    let engine = executor(&paper, EngineConfig::default());

    let SignalOutcome::Opened(summary) = engine.handle_signal("buy", BTC).await.unwrap() else {
        panic!("expected an opened position");
    };

    assert!(summary.protection.is_unprotected());
    assert!(paper.position(BTC, PositionSide::Long).await > 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_fully_protected_position_reports_every_layer() {
    let paper = paper().await;
    let engine = executor(&paper, EngineConfig::default());

    let SignalOutcome::Opened(summary) = engine.handle_signal("buy", BTC).await.unwrap() else {
        panic!("expected an opened position");
    };

    let limits = paper.limit_orders().await;
    assert!(summary.protection.take_profit_order.is_some());
    assert!(summary.protection.stop_loss_order.is_some());
    assert!(summary.protection.native_stop);
    assert_eq!(limits.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_position_read_error_during_close_is_retried() {
    let paper = paper().await;
    paper.set_position(BTC, PositionSide::Short, 0.05, 51_000.0).await;
    // The opposite-side check succeeds; the first read inside the close loop fails.
    paper.fail_after(PaperOp::GetPosition, 1, 1).await;
    let engine = executor(&paper, EngineConfig::default());

    let outcome = engine.handle_signal("buy", BTC).await.unwrap();
    assert!(matches!(outcome, SignalOutcome::Opened(_)));

    let markets = paper.market_orders().await;
    assert_eq!(markets.len(), 2);
    assert!(markets[0].reduce_only);
    assert_eq!(markets[0].position_idx, 2);
    assert_eq!(paper.position(BTC, PositionSide::Short).await, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_leverage_is_set_before_entry() {
    let paper = paper().await;
    let engine = executor(&paper, EngineConfig::default());

    engine.handle_signal("buy", BTC).await.unwrap();

    let journal = paper.journal().await;
    assert!(matches!(
        &journal[0],
        PaperEvent::Leverage { symbol, leverage: 10, .. } if symbol == BTC
    ));
    assert!(matches!(journal[1], PaperEvent::MarketOrder(_)));
}

#[tokio::test(start_paused = true)]
async fn test_monitor_dedupe_is_opt_in() {
    // Another registration for the same position is already live.
    let paper = paper().await;
    let engine = executor(&paper, EngineConfig::default());
    let _live = engine
        .registry()
        .try_register(PositionKey::new(BTC, PositionSide::Long), false)
        .unwrap();

    let SignalOutcome::Opened(summary) = engine.handle_signal("buy", BTC).await.unwrap() else {
        panic!("expected an opened position");
    };
    assert!(summary.trailing_monitor);
    assert_eq!(engine.registry().active_count(), 2);

    let paper = common::paper().await;
    let config = EngineConfig {
        dedupe_monitors: true,
        ..EngineConfig::default()
    };
    let engine = executor(&paper, config);
    let _live = engine
        .registry()
        .try_register(PositionKey::new(BTC, PositionSide::Long), false)
        .unwrap();

    let SignalOutcome::Opened(summary) = engine.handle_signal("buy", BTC).await.unwrap() else {
        panic!("expected an opened position");
    };
    assert!(!summary.trailing_monitor);
    assert_eq!(engine.registry().active_count(), 1);
}
