use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use souba_api::server::AppState;
use souba_api::ws::fanout::spawn_fanout;
use souba_api::ws::registry::ConnectionRegistry;
use souba_collector::backfill::{BackfillEngine, BackfillRequest, KindOutcome};
use souba_collector::supervisor::Supervisor;
use souba_core::common::DataKind;
use souba_core::config::{AppConfig, ReferenceDoc};
use souba_core::store::port::{ChangeFeed, SeriesFilter, SeriesResolver, TimeSeriesStore};
use souba_store::listen::PgChangeFeed;
use souba_store::reference::{PgSeriesResolver, sync_reference};
use souba_store::timeseries::PgTimeSeriesStore;
use souba_store::{downtime, pool, schema};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Souba 行情管道：采集、存储与分发加密货币永续市场数据。
#[derive(Parser)]
#[command(name = "souba", version, about)]
struct Cli {
    /// 运行配置文件路径 (TOML)
    #[arg(long, global = true, default_value = "config.toml", env = "SOUBA_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 启动只读查询网关与 /ws 实时扇出
    ServeApi,
    /// 启动交易所采集器与分钟聚合
    RunCollectors,
    /// 回补历史 K 线
    BackfillCandles(BackfillArgs),
    /// 回补历史资金费率
    BackfillFunding(BackfillArgs),
    /// 汇报各序列/市场的数据陈旧度
    DetectDowntime {
        /// 只看指定交易所
        #[arg(long)]
        exchange: Option<String>,
    },
    /// 将声明式参照配置同步进参照表
    SyncConfig {
        /// 参照配置文档路径
        #[arg(long, default_value = "souba.toml")]
        reference: PathBuf,
    },
    /// 执行数据库迁移 (幂等)
    Migrate,
}

#[derive(Args)]
struct BackfillArgs {
    /// 按交易所筛选
    #[arg(long)]
    exchange: Option<String>,
    /// 按基础资产筛选
    #[arg(long)]
    coin: Option<String>,
    /// 回补最近 N 天 (与 --start/--end 互斥时以显式窗口优先)
    #[arg(long, default_value_t = 1)]
    days: i64,
    /// 显式窗口起点 (RFC3339)
    #[arg(long)]
    start: Option<DateTime<Utc>>,
    /// 显式窗口终点 (RFC3339)
    #[arg(long)]
    end: Option<DateTime<Utc>>,
}

impl BackfillArgs {
    fn to_request(&self, kind: DataKind) -> BackfillRequest {
        let filter = SeriesFilter {
            exchange: self.exchange.clone(),
            coin: self.coin.clone(),
        };
        match (self.start, self.end) {
            (Some(start), end) => BackfillRequest {
                filter,
                kind,
                start,
                end: end.unwrap_or_else(Utc::now),
            },
            _ => {
                let end = self.end.unwrap_or_else(Utc::now);
                BackfillRequest {
                    filter,
                    kind,
                    start: end - Duration::days(self.days),
                    end,
                }
            }
        }
    }
}

/// 进程级致命错误分类，决定退出码。
enum Fatal {
    /// 配置无效 (退出码 2)
    Config(String),
    /// 其余致命错误 (退出码 1)
    Runtime(String),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(interrupted) => {
            if interrupted {
                ExitCode::from(130)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(Fatal::Config(msg)) => {
            error!("configuration error: {}", msg);
            ExitCode::from(2)
        }
        Err(Fatal::Runtime(msg)) => {
            error!("fatal: {}", msg);
            ExitCode::from(1)
        }
    }
}

/// 初始化两路输出日志 (控制台 + 滚动文件)。
fn init_tracing() {
    let file_appender = tracing_appender::rolling::daily("logs", "souba.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // guard 必须活到进程尽头，否则缓冲日志丢失
    std::mem::forget(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(
            std::io::stdout
                .with_max_level(tracing::Level::INFO)
                .and(non_blocking.with_max_level(tracing::Level::DEBUG)),
        )
        .with_ansi(true)
        .init();
}

/// # Summary
/// 加载运行配置：TOML 文件 + `SOUBA_` 前缀环境变量覆盖 + `DATABASE_URL` 惯例。
fn load_config(path: &PathBuf) -> Result<AppConfig, Fatal> {
    let mut builder = config::Config::builder();
    if path.exists() {
        builder = builder.add_source(config::File::from(path.as_path()).required(true));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("SOUBA")
            .separator("__")
            .try_parsing(true),
    );

    let raw = builder
        .build()
        .map_err(|e| Fatal::Config(e.to_string()))?;

    let mut app_config: AppConfig = if path.exists() {
        raw.try_deserialize()
            .map_err(|e| Fatal::Config(e.to_string()))?
    } else {
        // 完全无配置文件时回退默认值，仅叠加环境变量
        raw.try_deserialize().unwrap_or_default()
    };

    // 十二要素惯例: DATABASE_URL 覆盖配置文件
    if let Ok(url) = std::env::var("DATABASE_URL") {
        app_config.database.url = url;
    }
    Ok(app_config)
}

/// 组装存储层三件套: 连接池 + 网关 + 解析器。迁移幂等，启动时一律执行。
async fn bootstrap_store(
    config: &AppConfig,
) -> Result<(Arc<dyn TimeSeriesStore>, Arc<dyn SeriesResolver>, pool::PgPool), Fatal> {
    let pg_pool = pool::connect(&config.database)
        .await
        .map_err(|e| Fatal::Runtime(e.to_string()))?;
    schema::migrate(&pg_pool)
        .await
        .map_err(|e| Fatal::Runtime(e.to_string()))?;

    let store: Arc<dyn TimeSeriesStore> =
        Arc::new(PgTimeSeriesStore::new(pg_pool.clone()));
    let resolver: Arc<dyn SeriesResolver> = PgSeriesResolver::load(pg_pool.clone())
        .await
        .map_err(|e| Fatal::Runtime(e.to_string()))?;
    Ok((store, resolver, pg_pool))
}

/// 返回 Ok(true) 表示因中断信号退出。
async fn run(cli: Cli) -> Result<bool, Fatal> {
    let config = load_config(&cli.config)?;
    info!(command = ?std::env::args().nth(1), "souba starting");

    match cli.command {
        Command::Migrate => {
            let pg_pool = pool::connect(&config.database)
                .await
                .map_err(|e| Fatal::Runtime(e.to_string()))?;
            schema::migrate(&pg_pool)
                .await
                .map_err(|e| Fatal::Runtime(e.to_string()))?;
            info!("migrations applied");
            Ok(false)
        }

        Command::SyncConfig { reference } => {
            let raw = std::fs::read_to_string(&reference).map_err(|e| {
                Fatal::Config(format!("cannot read {}: {}", reference.display(), e))
            })?;
            let doc: ReferenceDoc =
                toml::from_str(&raw).map_err(|e| Fatal::Config(e.to_string()))?;

            let (_, resolver, pg_pool) = bootstrap_store(&config).await?;
            let report = sync_reference(&pg_pool, &doc)
                .await
                .map_err(|e| Fatal::Runtime(e.to_string()))?;
            resolver
                .refresh()
                .await
                .map_err(|e| Fatal::Runtime(e.to_string()))?;
            println!(
                "synced: {} exchanges, {} coins, {} quotes, {} market types, {} intervals, {} markets, {} series",
                report.exchanges,
                report.coins,
                report.quotes,
                report.market_types,
                report.intervals,
                report.markets,
                report.series
            );
            Ok(false)
        }

        Command::ServeApi => {
            let (store, resolver, pg_pool) = bootstrap_store(&config).await?;
            let config = Arc::new(config);
            let registry = ConnectionRegistry::new(config.websocket.clone());
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            let feed: Arc<dyn ChangeFeed> = Arc::new(PgChangeFeed::new(pg_pool));
            let _fanout = spawn_fanout(
                feed,
                Arc::clone(&store),
                Arc::clone(&registry),
                shutdown_rx.clone(),
            );
            let _heartbeat = registry.spawn_heartbeat(shutdown_rx.clone());

            let state = AppState {
                store,
                resolver,
                registry,
                config: Arc::clone(&config),
                collector_states: Arc::new(HashMap::new),
            };
            let bind_addr = format!("{}:{}", config.server.host, config.server.port);

            let server = tokio::spawn(async move {
                souba_api::server::start_server(state, &bind_addr, shutdown_rx).await
            });

            tokio::signal::ctrl_c()
                .await
                .map_err(|e| Fatal::Runtime(e.to_string()))?;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            match server.await {
                Ok(Ok(())) => Ok(true),
                Ok(Err(e)) => Err(Fatal::Runtime(e.to_string())),
                Err(e) => Err(Fatal::Runtime(e.to_string())),
            }
        }

        Command::RunCollectors => {
            let (store, resolver, _pg_pool) = bootstrap_store(&config).await?;
            let supervisor = Supervisor::start(resolver, store, config.collector.clone());

            tokio::signal::ctrl_c()
                .await
                .map_err(|e| Fatal::Runtime(e.to_string()))?;
            info!("shutdown signal received");
            supervisor.shutdown().await;
            Ok(true)
        }

        Command::BackfillCandles(args) => {
            run_backfill(&config, args.to_request(DataKind::Candle)).await
        }

        Command::BackfillFunding(args) => {
            run_backfill(&config, args.to_request(DataKind::Funding)).await
        }

        Command::DetectDowntime { exchange } => {
            let (store, resolver, _pg_pool) = bootstrap_store(&config).await?;
            let filter = SeriesFilter {
                exchange,
                coin: None,
            };
            let entries = downtime::staleness_report(&store, &resolver, &filter)
                .await
                .map_err(|e| Fatal::Runtime(e.to_string()))?;
            for entry in entries {
                match (entry.latest, entry.age_seconds) {
                    (Some(latest), Some(age)) => println!(
                        "{:<12} {:<40} latest={} age={}s",
                        entry.kind.to_string(),
                        entry.label,
                        latest.to_rfc3339(),
                        age
                    ),
                    _ => println!(
                        "{:<12} {:<40} no rows collected",
                        entry.kind.to_string(),
                        entry.label
                    ),
                }
            }
            Ok(false)
        }
    }
}

/// 执行一次回补并打印报告。全部键失败视为致命。
async fn run_backfill(config: &AppConfig, request: BackfillRequest) -> Result<bool, Fatal> {
    let (store, resolver, _pg_pool) = bootstrap_store(config).await?;

    let sources = ["hyperliquid", "binance"]
        .into_iter()
        .filter_map(souba_collector::adapters::history_for)
        .collect();
    let engine = BackfillEngine::new(store, resolver, sources);

    let report = engine.run(&request).await;
    if report.is_empty() {
        return Err(Fatal::Config(
            "no active keys match the backfill selection".to_string(),
        ));
    }

    let mut failures = 0usize;
    for entry in &report {
        match &entry.outcome {
            KindOutcome::Completed { rows, pages } => {
                println!("{:<12} {:<40} rows={} pages={}", entry.kind.to_string(), entry.label, rows, pages);
            }
            KindOutcome::NotRecoverable => {
                println!("{:<12} {:<40} not recoverable", entry.kind.to_string(), entry.label);
            }
            KindOutcome::Failed(msg) => {
                failures += 1;
                println!("{:<12} {:<40} FAILED: {}", entry.kind.to_string(), entry.label, msg);
            }
        }
    }

    if failures == report.len() {
        return Err(Fatal::Runtime("every backfill target failed".to_string()));
    }
    Ok(false)
}
