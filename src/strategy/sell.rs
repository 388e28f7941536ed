use super::{
    profit_multiplier, seconds_since, DecisionContext, SellDecision, SellKind,
    MIN_POSITION_AGE_SECS,
};

/// Decide whether to sell on this tick and which open position to close
pub fn evaluate_sell(ctx: &DecisionContext<'_>) -> SellDecision {
    let params = ctx.params;
    let market = ctx.market;
    let ledger = ctx.ledger;

    let Some(most_recent) = ledger.most_recent() else {
        return SellDecision::skip("no open positions");
    };

    if let Some(force) = ctx.session.force_sell {
        return match force.order_id {
            Some(order_id) => match ledger.find(order_id) {
                Some(position) => SellDecision::sell(
                    position,
                    SellKind::Forced,
                    format!("force sell of order {}", order_id),
                ),
                None => SellDecision::skip(format!("force sell: order {} is not open", order_id)),
            },
            None => SellDecision::sell(most_recent, SellKind::Forced, "force sell of most recent"),
        };
    }

    if market.is_stale(ctx.now) {
        return SellDecision::skip("market data is stale");
    }

    if let Some(elapsed) = seconds_since(ctx.session.last_sell_canceled_at, ctx.now) {
        if elapsed < params.sell_wait_after_cancel as i64 {
            return SellDecision::skip(format!(
                "waiting after canceled sell: {}s of {}s",
                elapsed, params.sell_wait_after_cancel
            ));
        }
    }

    if !params.exit && params.sell_to_cover && !ctx.funds_available() {
        let floor = most_recent.price * (1.0 - params.buy_repeat_threshold_down);
        if market.price < floor {
            return SellDecision::sell(
                most_recent,
                SellKind::ToCover,
                format!(
                    "sell to cover: funds {:.2} short, price {:.8} below {:.8}",
                    ctx.deployable_fiat(),
                    market.price,
                    floor
                ),
            );
        }
    }

    if params.stoploss > 0.0 {
        if let Some(position) = ledger.highest_stoploss(market.price, params.stoploss) {
            return SellDecision::sell(
                position,
                SellKind::Stoploss,
                format!(
                    "stoploss: price {:.8} at or below {:.8} less {:.2}%",
                    market.price,
                    position.price,
                    params.stoploss * 100.0
                ),
            );
        }
    }

    let profit_ratio = params.profit_min * profit_multiplier(ledger.sells_last_hour);
    let Some(position) =
        ledger.lowest_profitable(market.price, params.exchange_commission, profit_ratio)
    else {
        return SellDecision::skip(format!(
            "no position profitable at {:.8} for {:.2}%",
            market.price,
            profit_ratio * 100.0
        ));
    };

    let age = (ctx.now - position.opened_at()).num_seconds();
    if age < MIN_POSITION_AGE_SECS {
        return SellDecision::skip(format!("order {} open for only {}s", position.order_id, age));
    }

    if market.rsi3 > params.sell_hold_on_rsi3 {
        return SellDecision::skip(format!(
            "holding order {}: rsi3 {:.2} above {:.2}",
            position.order_id, market.rsi3, params.sell_hold_on_rsi3
        ));
    }

    SellDecision::sell(
        position,
        SellKind::Profit,
        format!(
            "profit: order {} bought at {:.8}, price {:.8}",
            position.order_id, position.price, market.price
        ),
    )
}
