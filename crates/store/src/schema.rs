use souba_core::store::error::StoreError;
use sqlx::PgPool;
use tracing::info;

/// 参照表 DDL。名称大小写敏感且唯一；实体只停用、不删除。
const DDL_REFERENCE: &str = r#"
CREATE TABLE IF NOT EXISTS exchanges (
    id           SERIAL PRIMARY KEY,
    name         TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    active       BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE TABLE IF NOT EXISTS coins (
    id           SERIAL PRIMARY KEY,
    name         TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    active       BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE TABLE IF NOT EXISTS quotes (
    id           SERIAL PRIMARY KEY,
    name         TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    active       BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE TABLE IF NOT EXISTS market_types (
    id           SERIAL PRIMARY KEY,
    name         TEXT NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    active       BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE TABLE IF NOT EXISTS intervals (
    id      SERIAL PRIMARY KEY,
    name    TEXT NOT NULL UNIQUE,
    seconds BIGINT NOT NULL,
    active  BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE TABLE IF NOT EXISTS markets (
    id             SERIAL PRIMARY KEY,
    exchange_id    INTEGER NOT NULL REFERENCES exchanges(id),
    coin_id        INTEGER NOT NULL REFERENCES coins(id),
    quote_id       INTEGER NOT NULL REFERENCES quotes(id),
    market_type_id INTEGER NOT NULL REFERENCES market_types(id),
    active         BOOLEAN NOT NULL DEFAULT TRUE,
    UNIQUE (exchange_id, coin_id, quote_id, market_type_id)
);

CREATE TABLE IF NOT EXISTS series (
    id          SERIAL PRIMARY KEY,
    market_id   INTEGER NOT NULL REFERENCES markets(id),
    interval_id INTEGER NOT NULL REFERENCES intervals(id),
    active      BOOLEAN NOT NULL DEFAULT TRUE,
    UNIQUE (market_id, interval_id)
);
"#;

/// 时序表 DDL。价格 NUMERIC(30,18)、量 NUMERIC(40,18)、费率 NUMERIC(20,18)，
/// 跨交易所价格跨越约 18 个数量级，二进制浮点禁止入库。
const DDL_TIMESERIES: &str = r#"
CREATE TABLE IF NOT EXISTS candles (
    time        TIMESTAMPTZ NOT NULL,
    series_id   INTEGER NOT NULL,
    open        NUMERIC(30,18) NOT NULL,
    high        NUMERIC(30,18) NOT NULL,
    low         NUMERIC(30,18) NOT NULL,
    close       NUMERIC(30,18) NOT NULL,
    volume      NUMERIC(40,18) NOT NULL,
    trade_count BIGINT,
    PRIMARY KEY (time, series_id)
);

CREATE TABLE IF NOT EXISTS funding (
    time              TIMESTAMPTZ NOT NULL,
    market_id         INTEGER NOT NULL,
    funding_rate      NUMERIC(20,18),
    premium           NUMERIC(20,18),
    mark_price        NUMERIC(30,18),
    index_price       NUMERIC(30,18),
    oracle_price      NUMERIC(30,18),
    mid_price         NUMERIC(30,18),
    next_funding_time TIMESTAMPTZ,
    PRIMARY KEY (time, market_id)
);

CREATE TABLE IF NOT EXISTS open_interest (
    time               TIMESTAMPTZ NOT NULL,
    market_id          INTEGER NOT NULL,
    open_interest      NUMERIC(40,18),
    notional_value     NUMERIC(40,18),
    day_base_volume    NUMERIC(40,18),
    day_notional_volume NUMERIC(40,18),
    PRIMARY KEY (time, market_id)
);
"#;

/// 二级索引：BRIN 时间索引负责区间扫描，(键, 时间) 组合索引负责按序列查询。
const DDL_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS candles_time_brin ON candles USING BRIN (time);
CREATE INDEX IF NOT EXISTS candles_series_time ON candles (series_id, time DESC);

CREATE INDEX IF NOT EXISTS funding_time_brin ON funding USING BRIN (time);
CREATE INDEX IF NOT EXISTS funding_market_time ON funding (market_id, time DESC);

CREATE INDEX IF NOT EXISTS open_interest_time_brin ON open_interest USING BRIN (time);
CREATE INDEX IF NOT EXISTS open_interest_market_time ON open_interest (market_id, time DESC);
"#;

/// 安装了 timescaledb 扩展时转换为 1 天分块的 hypertable；否则保持普通表。
const DDL_HYPERTABLES: &str = r#"
DO $$
BEGIN
    IF EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'timescaledb') THEN
        PERFORM create_hypertable('candles', 'time',
            chunk_time_interval => INTERVAL '1 day', if_not_exists => TRUE);
        PERFORM create_hypertable('funding', 'time',
            chunk_time_interval => INTERVAL '1 day', if_not_exists => TRUE);
        PERFORM create_hypertable('open_interest', 'time',
            chunk_time_interval => INTERVAL '1 day', if_not_exists => TRUE);
    END IF;
END
$$;
"#;

/// 变更通知触发器。载荷固定为 {"key", "time"}（常量尺寸），
/// 完整行由监听端按主键读回，通道名与 `DataKind::channel` 保持一致。
const DDL_NOTIFY: &str = r#"
CREATE OR REPLACE FUNCTION souba_notify_candle() RETURNS trigger AS $fn$
BEGIN
    PERFORM pg_notify('souba_candle', json_build_object(
        'key', NEW.series_id,
        'time', (extract(epoch FROM NEW.time))::bigint
    )::text);
    RETURN NEW;
END;
$fn$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION souba_notify_funding() RETURNS trigger AS $fn$
BEGIN
    PERFORM pg_notify('souba_funding', json_build_object(
        'key', NEW.market_id,
        'time', (extract(epoch FROM NEW.time))::bigint
    )::text);
    RETURN NEW;
END;
$fn$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION souba_notify_oi() RETURNS trigger AS $fn$
BEGIN
    PERFORM pg_notify('souba_oi', json_build_object(
        'key', NEW.market_id,
        'time', (extract(epoch FROM NEW.time))::bigint
    )::text);
    RETURN NEW;
END;
$fn$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS candles_notify ON candles;
CREATE TRIGGER candles_notify
    AFTER INSERT OR UPDATE ON candles
    FOR EACH ROW EXECUTE FUNCTION souba_notify_candle();

DROP TRIGGER IF EXISTS funding_notify ON funding;
CREATE TRIGGER funding_notify
    AFTER INSERT OR UPDATE ON funding
    FOR EACH ROW EXECUTE FUNCTION souba_notify_funding();

DROP TRIGGER IF EXISTS open_interest_notify ON open_interest;
CREATE TRIGGER open_interest_notify
    AFTER INSERT OR UPDATE ON open_interest
    FOR EACH ROW EXECUTE FUNCTION souba_notify_oi();
"#;

/// # Summary
/// 执行全部内联迁移。幂等：每个对象均带 IF NOT EXISTS / OR REPLACE 保护，
/// 可在每次进程启动时安全运行。
///
/// # Logic
/// 1. 参照表 → 时序表 → hypertable 转换 → 二级索引 → 通知触发器，依序执行。
/// 2. 任一块失败立即中止并上抛 Init 错误。
///
/// # Arguments
/// * `pool`: 连接池。
///
/// # Returns
/// * `Result<(), StoreError>`
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    for (name, ddl) in [
        ("reference", DDL_REFERENCE),
        ("timeseries", DDL_TIMESERIES),
        ("hypertables", DDL_HYPERTABLES),
        ("indexes", DDL_INDEXES),
        ("notify", DDL_NOTIFY),
    ] {
        sqlx::raw_sql(ddl)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Init(format!("migration '{}' failed: {}", name, e)))?;
        info!(block = name, "migration block applied");
    }
    Ok(())
}
