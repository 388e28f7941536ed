use super::{seconds_since, BuyDecision, BuyKind, DecisionContext};
use crate::models::OrderSide;

/// Decide whether to buy on this tick and how much fiat to spend
///
/// Checks run in a fixed order and stop at the first rejection. A cycle
/// with no open positions only considers an INITIAL entry; a cycle with
/// open positions tries DOWN before UP.
pub fn evaluate_buy(ctx: &DecisionContext<'_>) -> BuyDecision {
    let params = ctx.params;
    let market = ctx.market;

    if market.price == 0.0 {
        return BuyDecision::skip("price is zero");
    }

    if !ctx.funds_available() {
        return BuyDecision::skip(format!(
            "insufficient funds: {:.2} available after stash, {:.2} required",
            ctx.deployable_fiat(),
            params.buy_quantity_fiat_down
        ));
    }

    if ctx.session.force_buy {
        return BuyDecision::buy(BuyKind::Forced, params.buy_quantity_fiat_init, "force buy");
    }

    if params.exit {
        return BuyDecision::skip("exit mode");
    }

    if market.is_stale(ctx.now) {
        return BuyDecision::skip("market data is stale");
    }

    if let Some(elapsed) = seconds_since(ctx.session.last_buy_at, ctx.now) {
        if elapsed < params.buy_wait as i64 {
            return BuyDecision::skip(format!(
                "waiting after last buy: {}s of {}s",
                elapsed, params.buy_wait
            ));
        }
    }

    let ceiling = market.high_24h * (1.0 - params.buy_24hs_highprice_entry);
    if market.price >= ceiling {
        return BuyDecision::skip(format!(
            "price {:.8} too close to 24h high {:.8}",
            market.price, market.high_24h
        ));
    }

    if ctx.ledger.is_empty() {
        return evaluate_initial(ctx);
    }

    let down = evaluate_down(ctx);
    if down.should_buy() {
        return down;
    }
    let up = evaluate_up(ctx);
    if up.should_buy() {
        return up;
    }
    BuyDecision::skip(format!("{}; {}", down.reason, up.reason))
}

fn evaluate_initial(ctx: &DecisionContext<'_>) -> BuyDecision {
    let params = ctx.params;
    let market = ctx.market;

    if market.rsi7 < params.buy_rsi7_entry && market.rsi3 > 0.0 {
        BuyDecision::buy(
            BuyKind::Initial,
            params.buy_quantity_fiat_init,
            format!("initial entry: rsi7 {:.2} < {:.2}", market.rsi7, params.buy_rsi7_entry),
        )
    } else {
        BuyDecision::skip(format!(
            "initial: rsi7 {:.2} rsi3 {:.2} outside entry",
            market.rsi7, market.rsi3
        ))
    }
}

fn evaluate_down(ctx: &DecisionContext<'_>) -> BuyDecision {
    let params = ctx.params;
    let market = ctx.market;
    let ledger = ctx.ledger;

    if params.buy_quantity_fiat_down == 0.0 {
        return BuyDecision::skip("down: disabled");
    }
    if market.rsi14 <= 0.0 {
        return BuyDecision::skip("down: rsi14 not available");
    }
    if market.direction < params.buy_direction_down {
        return BuyDecision::skip(format!(
            "down: direction {} below {}",
            market.direction, params.buy_direction_down
        ));
    }

    let mut threshold = params.buy_repeat_threshold_down;
    if ledger.last_two_were_buys() {
        threshold = params.down_threshold_second();
    }

    let target = ledger.last_buy_price * (1.0 - threshold);
    if market.price > target {
        return BuyDecision::skip(format!(
            "down: price {:.8} above {:.8}",
            market.price, target
        ));
    }

    BuyDecision::buy(
        BuyKind::Down,
        params.buy_quantity_fiat_down,
        format!(
            "down: price {:.8} at or below last buy {:.8} less {:.2}%",
            market.price,
            ledger.last_buy_price,
            threshold * 100.0
        ),
    )
}

fn evaluate_up(ctx: &DecisionContext<'_>) -> BuyDecision {
    let params = ctx.params;
    let market = ctx.market;
    let ledger = ctx.ledger;

    if params.buy_quantity_fiat_up == 0.0 {
        return BuyDecision::skip("up: disabled");
    }
    if market.rsi7 > params.buy_rsi7_entry {
        return BuyDecision::skip(format!(
            "up: rsi7 {:.2} above {:.2}",
            market.rsi7, params.buy_rsi7_entry
        ));
    }
    if market.direction < params.buy_direction_up {
        return BuyDecision::skip(format!(
            "up: direction {} below {}",
            market.direction, params.buy_direction_up
        ));
    }

    let floor = ledger.last_sell_price * (1.0 + params.buy_repeat_threshold_up);
    if market.price < floor {
        return BuyDecision::skip(format!("up: price {:.8} below {:.8}", market.price, floor));
    }

    if ledger.last_side() != Some(OrderSide::Sell) {
        return BuyDecision::skip("up: last order was not a sell");
    }

    if let Some(recent) = ledger.most_recent() {
        let half = params.profit_min / 2.0;
        let price = market.price;
        let above_band = price > recent.price && price < recent.price * (1.0 + half);
        let below_band = price < recent.price && price > recent.price * (1.0 - half);
        if above_band || below_band {
            return BuyDecision::skip(format!(
                "up: price {:.8} too close to open position {:.8}",
                price, recent.price
            ));
        }
    }

    let ceiling = market.price * (1.0 + params.buy_repeat_threshold_up);
    if ledger.count_priced_above(ceiling) > 1 {
        return BuyDecision::skip(format!("up: more than one position above {:.8}", ceiling));
    }

    let count = ledger.count();
    let fiat_amount =
        if count == 1 || count > params.buy_repeat_threshold_down_second_start_count {
            params.buy_quantity_fiat_init
        } else {
            params.buy_quantity_fiat_up
        };

    BuyDecision::buy(
        BuyKind::Up,
        fiat_amount,
        format!(
            "up: price {:.8} above last sell {:.8}",
            market.price, ledger.last_sell_price
        ),
    )
}
