// =============================================================================
// PersistentStore — durable signals, orders, and equity snapshots (§4.2)
// =============================================================================
//
// Backed by an embedded SQLite database opened through `sqlx`'s async
// driver, matching the rest of the engine's Tokio-native stack rather than
// requiring `spawn_blocking` the way a synchronous driver would. SQLite's own
// journal already gives crash-atomic writes per statement — the temp-file +
// rename discipline elsewhere in this crate governs the separate JSONL event
// log and the RuntimeConfig file, not this store (see DESIGN.md Open
// Question 3).

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::types::{
    AccountMode, OrderRecord, OrderStatus, OrderTag, OrderType, Side, SignalRecord, SignalSource,
    TakeProfitLevel,
};

pub struct PersistentStore {
    pool: SqlitePool,
}

impl PersistentStore {
    /// Open (creating if absent) the SQLite database at `path`, running
    /// migrations to create the schema on first use.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open sqlite store at {path}"))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                alert_id TEXT NOT NULL UNIQUE,
                source TEXT NOT NULL,
                coin TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price REAL NOT NULL,
                stop_loss REAL NOT NULL,
                take_profits_json TEXT NOT NULL,
                risk_check_passed INTEGER NOT NULL,
                risk_check_reason TEXT,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create signals table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signal_id INTEGER NOT NULL,
                exchange_order_id TEXT,
                coin TEXT NOT NULL,
                side TEXT NOT NULL,
                size REAL NOT NULL,
                price REAL NOT NULL,
                order_type TEXT NOT NULL,
                tag TEXT NOT NULL,
                status TEXT NOT NULL,
                mode TEXT NOT NULL,
                filled_at INTEGER,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create orders table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS equity_snapshots (
                ts INTEGER PRIMARY KEY,
                equity REAL NOT NULL,
                open_positions INTEGER NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create equity_snapshots table")?;

        info!(path, "persistent store opened");
        Ok(Self { pool })
    }

    /// In-memory store, useful for tests and demo-mode runs.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    pub async fn has_signal(&self, alert_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM signals WHERE alert_id = ?1")
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await
            .context("has_signal query failed")?;
        Ok(row.is_some())
    }

    /// Insert a SignalRecord. Returns `Ok(None)` (not an error) when
    /// `alert_id` already exists — the dispatcher's idempotency check (§4.4
    /// step 3) treats that as `Duplicate`, not a store failure.
    pub async fn insert_signal(&self, record: &SignalRecordDraft) -> Result<Option<i64>> {
        let tp_json = serde_json::to_string(&record.take_profits).context("serialize take_profits")?;

        let result = sqlx::query(
            r#"
            INSERT INTO signals
                (alert_id, source, coin, side, entry_price, stop_loss, take_profits_json,
                 risk_check_passed, risk_check_reason, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&record.alert_id)
        .bind(record.source.to_string())
        .bind(&record.coin)
        .bind(record.side.to_string())
        .bind(record.entry_price)
        .bind(record.stop_loss)
        .bind(tp_json)
        .bind(record.risk_check_passed)
        .bind(&record.risk_check_reason)
        .bind(record.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) => Ok(Some(r.last_insert_rowid())),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => Ok(None),
            Err(e) => Err(e).context("insert_signal failed"),
        }
    }

    pub async fn insert_order(&self, record: &OrderRecordDraft) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO orders
                (signal_id, exchange_order_id, coin, side, size, price, order_type, tag, status, mode, filled_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(record.signal_id)
        .bind(&record.exchange_order_id)
        .bind(&record.coin)
        .bind(record.side.to_string())
        .bind(record.size)
        .bind(record.price)
        .bind(record.order_type.to_string())
        .bind(record.tag.to_string())
        .bind(record.status.to_string())
        .bind(record.mode.to_string())
        .bind(record.filled_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .context("insert_order failed")?;

        Ok(result.last_insert_rowid())
    }

    pub async fn update_order_status(&self, id: i64, status: OrderStatus) -> Result<()> {
        sqlx::query("UPDATE orders SET status = ?1 WHERE id = ?2")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("update_order_status failed")?;
        Ok(())
    }

    pub async fn get_pending_orders(&self) -> Result<Vec<OrderRecord>> {
        let rows = sqlx::query("SELECT * FROM orders WHERE status = 'pending'")
            .fetch_all(&self.pool)
            .await
            .context("get_pending_orders failed")?;
        rows.iter().map(row_to_order).collect()
    }

    pub async fn get_recent_orders(&self, limit: i64) -> Result<Vec<OrderRecord>> {
        let rows = sqlx::query("SELECT * FROM orders ORDER BY id DESC LIMIT ?1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("get_recent_orders failed")?;
        rows.iter().map(row_to_order).collect()
    }

    pub async fn insert_equity_snapshot(&self, ts: i64, equity: f64, open_positions: u32) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO equity_snapshots (ts, equity, open_positions) VALUES (?1, ?2, ?3)")
            .bind(ts)
            .bind(equity)
            .bind(open_positions as i64)
            .execute(&self.pool)
            .await
            .context("insert_equity_snapshot failed")?;
        Ok(())
    }

    pub async fn get_recent_equity(&self, limit: i64) -> Result<Vec<(i64, f64, u32)>> {
        let rows = sqlx::query("SELECT ts, equity, open_positions FROM equity_snapshots ORDER BY ts DESC LIMIT ?1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("get_recent_equity failed")?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<i64, _>("ts"), r.get::<f64, _>("equity"), r.get::<i64, _>("open_positions") as u32))
            .collect())
    }

    /// Count of filled entry orders for `coin` since `day_start_ts` — feeds
    /// the per-instrument daily trade-count guardrail (§4.4 step 4).
    pub async fn get_today_trade_count(&self, coin: &str, day_start_ts: i64) -> Result<u32> {
        let row = sqlx::query(
            "SELECT COUNT(*) as c FROM orders WHERE coin = ?1 AND tag = 'entry' AND status = 'filled' AND created_at >= ?2",
        )
        .bind(coin)
        .bind(day_start_ts)
        .fetch_one(&self.pool)
        .await
        .context("get_today_trade_count failed")?;
        Ok(row.get::<i64, _>("c") as u32)
    }

    /// Sum of realized PnL for `coin` closed since `day_start_ts`, matching
    /// each filled `exit` order to the filled `entry` order that opened the
    /// same signal and reproducing `PositionBook`'s own sign convention
    /// (long profits when price rises, short when it falls). Feeds the
    /// daily-loss guardrail (§4.4 step 5) for every signal source, not just
    /// the in-process `StrategyRunner` counters that only see
    /// `source=="strategy"` exits.
    pub async fn get_today_realized_pnl(&self, coin: &str, day_start_ts: i64) -> Result<f64> {
        let rows = sqlx::query(
            r#"
            SELECT n.side as direction, n.price as entry_price, e.price as exit_price, e.size as exit_size
            FROM orders e
            JOIN orders n ON n.signal_id = e.signal_id AND n.tag = 'entry' AND n.status = 'filled'
            WHERE e.coin = ?1 AND e.tag = 'exit' AND e.status = 'filled' AND e.created_at >= ?2
            "#,
        )
        .bind(coin)
        .bind(day_start_ts)
        .fetch_all(&self.pool)
        .await
        .context("get_today_realized_pnl failed")?;

        let mut total = 0.0;
        for row in &rows {
            let direction = parse_side(row.get::<String, _>("direction").as_str())?;
            let entry_price: f64 = row.get("entry_price");
            let exit_price: f64 = row.get("exit_price");
            let size: f64 = row.get("exit_size");
            let sign = if direction.is_long() { 1.0 } else { -1.0 };
            total += (exit_price - entry_price) * size * sign;
        }
        Ok(total)
    }

    pub async fn get_recent_signals(&self, limit: i64) -> Result<Vec<SignalRecord>> {
        let rows = sqlx::query("SELECT * FROM signals ORDER BY id DESC LIMIT ?1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("get_recent_signals failed")?;
        rows.iter().map(row_to_signal).collect()
    }
}

/// Fields needed to insert a SignalRecord (id/created_at are assigned by the
/// store/caller).
pub struct SignalRecordDraft {
    pub alert_id: String,
    pub source: SignalSource,
    pub coin: String,
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profits: Vec<TakeProfitLevel>,
    pub risk_check_passed: bool,
    pub risk_check_reason: Option<String>,
    pub created_at: i64,
}

pub struct OrderRecordDraft {
    pub signal_id: i64,
    pub exchange_order_id: Option<String>,
    pub coin: String,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    pub order_type: OrderType,
    pub tag: OrderTag,
    pub status: OrderStatus,
    pub mode: AccountMode,
    pub filled_at: Option<i64>,
    pub created_at: i64,
}

fn row_to_order(row: &sqlx::sqlite::SqliteRow) -> Result<OrderRecord> {
    let side = parse_side(row.get::<String, _>("side").as_str())?;
    let status = parse_order_status(row.get::<String, _>("status").as_str())?;
    let mode = parse_account_mode(row.get::<String, _>("mode").as_str())?;
    let order_type = parse_order_type(row.get::<String, _>("order_type").as_str())?;
    let tag = parse_order_tag(row.get::<String, _>("tag").as_str())?;
    Ok(OrderRecord {
        id: row.get("id"),
        signal_id: row.get("signal_id"),
        exchange_order_id: row.get("exchange_order_id"),
        coin: row.get("coin"),
        side,
        size: row.get("size"),
        price: row.get("price"),
        order_type,
        tag,
        status,
        mode,
        filled_at: row.get("filled_at"),
        created_at: row.get("created_at"),
    })
}

fn parse_order_type(raw: &str) -> Result<OrderType> {
    match raw {
        "market" => Ok(OrderType::Market),
        "limit" => Ok(OrderType::Limit),
        "stop" => Ok(OrderType::Stop),
        other => anyhow::bail!("unknown order type in store row: {other}"),
    }
}

fn parse_order_tag(raw: &str) -> Result<OrderTag> {
    match raw {
        "entry" => Ok(OrderTag::Entry),
        "sl" => Ok(OrderTag::StopLoss),
        "trailing-sl" => Ok(OrderTag::TrailingStop),
        "exit" => Ok(OrderTag::Exit),
        other if other.starts_with("tp") => {
            let n: u8 = other[2..]
                .parse()
                .with_context(|| format!("unparseable take-profit tag: {other}"))?;
            Ok(OrderTag::TakeProfit(n))
        }
        other => anyhow::bail!("unknown order tag in store row: {other}"),
    }
}

fn row_to_signal(row: &sqlx::sqlite::SqliteRow) -> Result<SignalRecord> {
    let side = parse_side(row.get::<String, _>("side").as_str())?;
    let source = match row.get::<String, _>("source").as_str() {
        "strategy" => SignalSource::Strategy,
        "api" => SignalSource::Api,
        _ => SignalSource::Router,
    };
    let take_profits: Vec<TakeProfitLevel> =
        serde_json::from_str(&row.get::<String, _>("take_profits_json")).unwrap_or_default();

    Ok(SignalRecord {
        id: row.get("id"),
        alert_id: row.get("alert_id"),
        source,
        coin: row.get("coin"),
        side,
        entry_price: row.get("entry_price"),
        stop_loss: row.get("stop_loss"),
        take_profits,
        risk_check_passed: row.get::<i64, _>("risk_check_passed") != 0,
        risk_check_reason: row.get("risk_check_reason"),
        created_at: row.get("created_at"),
    })
}

fn parse_side(raw: &str) -> Result<Side> {
    match raw {
        "long" => Ok(Side::Long),
        "short" => Ok(Side::Short),
        other => anyhow::bail!("unknown side in store row: {other}"),
    }
}

fn parse_order_status(raw: &str) -> Result<OrderStatus> {
    match raw {
        "pending" => Ok(OrderStatus::Pending),
        "filled" => Ok(OrderStatus::Filled),
        "cancelled" => Ok(OrderStatus::Cancelled),
        "rejected" => Ok(OrderStatus::Rejected),
        other => anyhow::bail!("unknown order status in store row: {other}"),
    }
}

fn parse_account_mode(raw: &str) -> Result<AccountMode> {
    match raw {
        "Demo" => Ok(AccountMode::Demo),
        "Live" => Ok(AccountMode::Live),
        other => anyhow::bail!("unknown account mode in store row: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(alert_id: &str) -> SignalRecordDraft {
        SignalRecordDraft {
            alert_id: alert_id.to_string(),
            source: SignalSource::Strategy,
            coin: "BTC".into(),
            side: Side::Long,
            entry_price: 95_000.0,
            stop_loss: 94_000.0,
            take_profits: vec![TakeProfitLevel { price: 97_000.0, fraction: 0.5 }],
            risk_check_passed: true,
            risk_check_reason: None,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn insert_and_has_signal() {
        let store = PersistentStore::open_in_memory().await.unwrap();
        assert!(!store.has_signal("a1").await.unwrap());
        let id = store.insert_signal(&draft("a1")).await.unwrap();
        assert!(id.is_some());
        assert!(store.has_signal("a1").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_alert_id_returns_none_not_error() {
        let store = PersistentStore::open_in_memory().await.unwrap();
        let first = store.insert_signal(&draft("dup")).await.unwrap();
        assert!(first.is_some());
        let second = store.insert_signal(&draft("dup")).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn order_lifecycle_round_trips() {
        let store = PersistentStore::open_in_memory().await.unwrap();
        let signal_id = store.insert_signal(&draft("a2")).await.unwrap().unwrap();

        let order_id = store
            .insert_order(&OrderRecordDraft {
                signal_id,
                exchange_order_id: Some("ex-1".into()),
                coin: "BTC".into(),
                side: Side::Long,
                size: 0.01,
                price: 95_000.0,
                order_type: OrderType::Limit,
                tag: OrderTag::Entry,
                status: OrderStatus::Pending,
                mode: AccountMode::Demo,
                filled_at: None,
                created_at: 0,
            })
            .await
            .unwrap();

        let pending = store.get_pending_orders().await.unwrap();
        assert_eq!(pending.len(), 1);

        store.update_order_status(order_id, OrderStatus::Filled).await.unwrap();
        let pending = store.get_pending_orders().await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn equity_snapshots_append() {
        let store = PersistentStore::open_in_memory().await.unwrap();
        store.insert_equity_snapshot(1, 1000.0, 0).await.unwrap();
        store.insert_equity_snapshot(2, 1010.0, 1).await.unwrap();
        let recent = store.get_recent_equity(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].0, 2);
    }

    #[tokio::test]
    async fn realized_pnl_sums_closed_trades_by_direction() {
        let store = PersistentStore::open_in_memory().await.unwrap();

        let long_signal = store.insert_signal(&draft("long1")).await.unwrap().unwrap();
        store
            .insert_order(&OrderRecordDraft {
                signal_id: long_signal,
                exchange_order_id: Some("entry-1".into()),
                coin: "BTC".into(),
                side: Side::Long,
                size: 1.0,
                price: 100.0,
                order_type: OrderType::Limit,
                tag: OrderTag::Entry,
                status: OrderStatus::Filled,
                mode: AccountMode::Demo,
                filled_at: Some(0),
                created_at: 0,
            })
            .await
            .unwrap();
        store
            .insert_order(&OrderRecordDraft {
                signal_id: long_signal,
                exchange_order_id: Some("exit-1".into()),
                coin: "BTC".into(),
                side: Side::Short,
                size: 1.0,
                price: 110.0,
                order_type: OrderType::Market,
                tag: OrderTag::Exit,
                status: OrderStatus::Filled,
                mode: AccountMode::Demo,
                filled_at: Some(10),
                created_at: 10,
            })
            .await
            .unwrap();

        let mut short_draft = draft("short1");
        short_draft.side = Side::Short;
        let short_signal = store.insert_signal(&short_draft).await.unwrap().unwrap();
        store
            .insert_order(&OrderRecordDraft {
                signal_id: short_signal,
                exchange_order_id: Some("entry-2".into()),
                coin: "BTC".into(),
                side: Side::Short,
                size: 2.0,
                price: 100.0,
                order_type: OrderType::Limit,
                tag: OrderTag::Entry,
                status: OrderStatus::Filled,
                mode: AccountMode::Demo,
                filled_at: Some(20),
                created_at: 20,
            })
            .await
            .unwrap();
        store
            .insert_order(&OrderRecordDraft {
                signal_id: short_signal,
                exchange_order_id: Some("exit-2".into()),
                coin: "BTC".into(),
                side: Side::Long,
                size: 2.0,
                price: 95.0,
                order_type: OrderType::Market,
                tag: OrderTag::Exit,
                status: OrderStatus::Filled,
                mode: AccountMode::Demo,
                filled_at: Some(30),
                created_at: 30,
            })
            .await
            .unwrap();

        // +10 on the long, +10 on the short (100 -> 95, 2 units) = +20 total.
        let pnl = store.get_today_realized_pnl("BTC", 0).await.unwrap();
        assert!((pnl - 20.0).abs() < 1e-9);

        // A day boundary after the long's exit excludes it.
        let pnl_since_20 = store.get_today_realized_pnl("BTC", 20).await.unwrap();
        assert!((pnl_since_20 - 10.0).abs() < 1e-9);
    }
}
