use super::{Ledger, LedgerError, ProfitSummary};
use crate::models::{OpenPosition, Order, OrderRecord, OrderSide, OrderStatus};
use crate::session::SessionRow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};

/// Postgres-backed position ledger
pub struct PostgresLedger {
    pool: PgPool,
}

fn dec(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default()
}

fn num(value: Decimal, column: &str) -> Result<f64, LedgerError> {
    value
        .to_string()
        .parse()
        .map_err(|_| LedgerError::Decode(column.to_string()))
}

fn opt_num(value: Option<Decimal>, column: &str) -> Result<f64, LedgerError> {
    value.map(|v| num(v, column)).transpose().map(|v| v.unwrap_or(0.0))
}

fn parse_side(value: &str) -> Result<OrderSide, LedgerError> {
    OrderSide::parse(value).ok_or_else(|| LedgerError::Decode(format!("side {}", value)))
}

impl PostgresLedger {
    /// Connect to Postgres and run migrations
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    pub async fn new(database_url: &str) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres ledger");

        Ok(Self { pool })
    }

    /// The `price` column holds the recorded price; the limit price is not kept
    fn record_from_row(row: &PgRow) -> Result<OrderRecord, LedgerError> {
        let side: String = row.get("side");
        let status: String = row.get("status");
        let recorded_price = num(row.get("price"), "price")?;

        let order = Order {
            client_order_id: row.get("client_order_id"),
            order_id: row.get("order_id"),
            symbol: row.get("symbol"),
            side: parse_side(&side)?,
            status: OrderStatus::parse(&status),
            price: recorded_price,
            requested_quantity: num(row.get("requested_quantity"), "requested_quantity")?,
            executed_quantity: num(row.get("executed_quantity"), "executed_quantity")?,
            cumulative_quote_quantity: num(
                row.get("cumulative_quote_quantity"),
                "cumulative_quote_quantity",
            )?,
            transact_time: row.get("transact_time"),
        };

        Ok(OrderRecord {
            order,
            thread_id: row.get("thread_id"),
            thread_id_session: row.get("thread_id_session"),
            order_id_source: row.get("order_id_source"),
            recorded_price,
        })
    }

    async fn realized_profit(&self, thread_id: Option<&str>) -> Result<f64, LedgerError> {
        let total: Option<Decimal> = sqlx::query_scalar(
            r#"
            SELECT SUM(s.cumulative_quote_quantity
                       - b.cumulative_quote_quantity * s.executed_quantity / b.executed_quantity)
            FROM orders s
            JOIN orders b ON b.order_id = s.order_id_source
            WHERE s.side = 'SELL'
              AND s.status IN ('FILLED', 'PARTIALLY_FILLED')
              AND b.executed_quantity > 0
              AND ($1::TEXT IS NULL OR s.thread_id = $1)
            "#,
        )
        .bind(thread_id)
        .fetch_one(&self.pool)
        .await?;

        opt_num(total, "profit")
    }
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn save_order(&self, record: &OrderRecord) -> Result<(), LedgerError> {
        let order = &record.order;

        sqlx::query(
            r#"
            INSERT INTO orders (
                order_id, client_order_id, thread_id, thread_id_session, symbol,
                side, status, price, requested_quantity, executed_quantity,
                cumulative_quote_quantity, transact_time, order_id_source
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (order_id) DO UPDATE SET
                status = EXCLUDED.status,
                price = EXCLUDED.price,
                executed_quantity = EXCLUDED.executed_quantity,
                cumulative_quote_quantity = EXCLUDED.cumulative_quote_quantity,
                updated_at = NOW()
            "#,
        )
        .bind(order.order_id)
        .bind(&order.client_order_id)
        .bind(&record.thread_id)
        .bind(&record.thread_id_session)
        .bind(&order.symbol)
        .bind(order.side.as_str())
        .bind(order.status.as_str())
        .bind(dec(record.recorded_price))
        .bind(dec(order.requested_quantity))
        .bind(dec(order.executed_quantity))
        .bind(dec(order.cumulative_quote_quantity))
        .bind(order.transact_time)
        .bind(record.order_id_source)
        .execute(&self.pool)
        .await?;

        tracing::debug!(order_id = order.order_id, side = %order.side, "Saved order");

        Ok(())
    }

    async fn update_order(&self, order: &Order, recorded_price: f64) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, price = $3, executed_quantity = $4,
                cumulative_quote_quantity = $5, updated_at = NOW()
            WHERE order_id = $1
            "#,
        )
        .bind(order.order_id)
        .bind(order.status.as_str())
        .bind(dec(recorded_price))
        .bind(dec(order.executed_quantity))
        .bind(dec(order.cumulative_quote_quantity))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_position(
        &self,
        position: &OpenPosition,
        thread_id_session: &str,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO thread_positions (
                order_id, thread_id, thread_id_session, price,
                executed_quantity, cumulative_quote_quantity, transact_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (order_id) DO UPDATE SET
                price = EXCLUDED.price,
                executed_quantity = EXCLUDED.executed_quantity,
                cumulative_quote_quantity = EXCLUDED.cumulative_quote_quantity
            "#,
        )
        .bind(position.order_id)
        .bind(&position.thread_id)
        .bind(thread_id_session)
        .bind(dec(position.price))
        .bind(dec(position.executed_quantity))
        .bind(dec(position.cumulative_quote_quantity))
        .bind(position.transact_time)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_position(&self, order_id: i64) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM thread_positions WHERE order_id = $1")
            .bind(order_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn open_positions(&self, thread_id: &str) -> Result<Vec<OpenPosition>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, thread_id, price, executed_quantity,
                   cumulative_quote_quantity, transact_time
            FROM thread_positions
            WHERE thread_id = $1
            ORDER BY transact_time ASC, order_id ASC
            "#,
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in rows {
            positions.push(OpenPosition {
                order_id: row.get("order_id"),
                thread_id: row.get("thread_id"),
                price: num(row.get("price"), "price")?,
                executed_quantity: num(row.get("executed_quantity"), "executed_quantity")?,
                cumulative_quote_quantity: num(
                    row.get("cumulative_quote_quantity"),
                    "cumulative_quote_quantity",
                )?,
                transact_time: row.get("transact_time"),
            });
        }

        Ok(positions)
    }

    async fn count_positions(&self, thread_id: &str) -> Result<usize, LedgerError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM thread_positions WHERE thread_id = $1")
                .bind(thread_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count.max(0) as usize)
    }

    async fn last_price(&self, thread_id: &str, side: OrderSide) -> Result<f64, LedgerError> {
        let price: Option<Decimal> = sqlx::query_scalar(
            r#"
            SELECT price FROM orders
            WHERE thread_id = $1 AND side = $2 AND status IN ('FILLED', 'PARTIALLY_FILLED')
            ORDER BY transact_time DESC, order_id DESC
            LIMIT 1
            "#,
        )
        .bind(thread_id)
        .bind(side.as_str())
        .fetch_optional(&self.pool)
        .await?;

        opt_num(price, "price")
    }

    async fn last_sides(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<OrderSide>, LedgerError> {
        let sides: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT side FROM orders
            WHERE thread_id = $1 AND status IN ('FILLED', 'PARTIALLY_FILLED')
            ORDER BY transact_time DESC, order_id DESC
            LIMIT $2
            "#,
        )
        .bind(thread_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        sides.iter().map(|s| parse_side(s)).collect()
    }

    async fn count_orders_since(
        &self,
        thread_id: &str,
        side: OrderSide,
        since: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM orders
            WHERE thread_id = $1 AND side = $2
              AND status IN ('FILLED', 'PARTIALLY_FILLED')
              AND transact_time >= $3
            "#,
        )
        .bind(thread_id)
        .bind(side.as_str())
        .bind(since.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as usize)
    }

    async fn thread_symbol(&self, thread_id: &str) -> Result<Option<String>, LedgerError> {
        Ok(sqlx::query_scalar(
            "SELECT symbol FROM orders WHERE thread_id = $1 ORDER BY transact_time ASC LIMIT 1",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn resumable_threads(&self) -> Result<Vec<String>, LedgerError> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT thread_id FROM thread_positions
            GROUP BY thread_id
            ORDER BY MIN(transact_time) ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn pending_order(&self, thread_id: &str) -> Result<Option<OrderRecord>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT order_id, client_order_id, thread_id, thread_id_session, symbol,
                   side, status, price, requested_quantity, executed_quantity,
                   cumulative_quote_quantity, transact_time, order_id_source
            FROM orders
            WHERE thread_id = $1 AND status IN ('NEW', 'PARTIALLY_FILLED')
            ORDER BY transact_time ASC
            LIMIT 1
            "#,
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn save_session(&self, row: &SessionRow) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                thread_id, thread_id_session, exchange, symbol_fiat,
                symbol_fiat_funds, symbol_funds, master, status_ok, latency_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (thread_id) DO UPDATE SET
                thread_id_session = EXCLUDED.thread_id_session,
                exchange = EXCLUDED.exchange,
                symbol_fiat = EXCLUDED.symbol_fiat,
                symbol_fiat_funds = EXCLUDED.symbol_fiat_funds,
                symbol_funds = EXCLUDED.symbol_funds,
                master = EXCLUDED.master,
                status_ok = EXCLUDED.status_ok,
                latency_ms = EXCLUDED.latency_ms,
                updated_at = NOW()
            "#,
        )
        .bind(&row.thread_id)
        .bind(&row.thread_id_session)
        .bind(&row.exchange)
        .bind(&row.symbol_fiat)
        .bind(dec(row.symbol_fiat_funds))
        .bind(dec(row.symbol_funds))
        .bind(row.master)
        .bind(row.status_ok)
        .bind(row.latency_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_session(&self, row: &SessionRow) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET thread_id_session = $2, symbol_fiat_funds = $3, symbol_funds = $4,
                master = $5, status_ok = $6, latency_ms = $7, updated_at = NOW()
            WHERE thread_id = $1
            "#,
        )
        .bind(&row.thread_id)
        .bind(&row.thread_id_session)
        .bind(dec(row.symbol_fiat_funds))
        .bind(dec(row.symbol_funds))
        .bind(row.master)
        .bind(row.status_ok)
        .bind(row.latency_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_session(&self, thread_id: &str) -> Result<Option<SessionRow>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT thread_id, thread_id_session, exchange, symbol_fiat,
                   symbol_fiat_funds, symbol_funds, master, status_ok, latency_ms
            FROM sessions
            WHERE thread_id = $1
            "#,
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(SessionRow {
            thread_id: row.get("thread_id"),
            thread_id_session: row.get("thread_id_session"),
            exchange: row.get("exchange"),
            symbol_fiat: row.get("symbol_fiat"),
            symbol_fiat_funds: num(row.get("symbol_fiat_funds"), "symbol_fiat_funds")?,
            symbol_funds: num(row.get("symbol_funds"), "symbol_funds")?,
            master: row.get("master"),
            status_ok: row.get("status_ok"),
            latency_ms: row.get("latency_ms"),
        }))
    }

    async fn delete_session(&self, thread_id: &str) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM sessions WHERE thread_id = $1")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn profit_summary(&self, thread_id: &str) -> Result<ProfitSummary, LedgerError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS open_positions, SUM(cumulative_quote_quantity) AS open_amount FROM thread_positions",
        )
        .fetch_one(&self.pool)
        .await?;

        let open_positions: i64 = row.get("open_positions");
        let open_amount: Option<Decimal> = row.get("open_amount");

        Ok(ProfitSummary {
            total_profit: self.realized_profit(None).await?,
            thread_profit: self.realized_profit(Some(thread_id)).await?,
            open_positions: open_positions.max(0) as usize,
            open_amount: opt_num(open_amount, "open_amount")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_conversion() {
        assert_eq!(num(dec(101.25), "price").unwrap(), 101.25);
        assert_eq!(opt_num(None, "price").unwrap(), 0.0);
        assert_eq!(dec(f64::NAN), Decimal::ZERO);
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running
    async fn test_postgres_position_round_trip() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let ledger = PostgresLedger::new(&url).await.unwrap();
        let thread_id = uuid::Uuid::new_v4().simple().to_string();

        let position = OpenPosition {
            order_id: chrono::Utc::now().timestamp_micros(),
            thread_id: thread_id.clone(),
            price: 100.0,
            executed_quantity: 0.5,
            cumulative_quote_quantity: 50.0,
            transact_time: chrono::Utc::now().timestamp_millis(),
        };

        ledger.save_position(&position, "s1").await.unwrap();
        assert_eq!(ledger.count_positions(&thread_id).await.unwrap(), 1);
        assert_eq!(ledger.open_positions(&thread_id).await.unwrap(), vec![position.clone()]);

        ledger.delete_position(position.order_id).await.unwrap();
        assert_eq!(ledger.count_positions(&thread_id).await.unwrap(), 0);
    }
}
