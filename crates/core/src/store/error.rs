use thiserror::Error;

/// # Summary
/// 存储层错误枚举，处理数据库连接、约束冲突与解析失败等问题。
///
/// # Invariants
/// - 必须通过 `thiserror` 派生 `Error` trait。
/// - `Transient` 与其余变体的区分决定网关是否重试。
#[derive(Error, Debug)]
pub enum StoreError {
    /// 非瞬时的数据库操作失败
    #[error("Database error: {0}")]
    Database(String),
    /// 瞬时故障（连接断开、死锁、池耗尽），重试预算耗尽后仍以本变体上抛
    #[error("Transient database error: {0}")]
    Transient(String),
    /// 输入违反文档化约束（OHLC 不变量、超限参数），永不重试
    #[error("Validation error: {0}")]
    Validation(String),
    /// 键无法解析或记录未找到
    #[error("Not found")]
    NotFound,
    /// 初始化存储失败（连接串、迁移）
    #[error("Initialization error: {0}")]
    Init(String),
}

impl StoreError {
    /// 判定错误是否为瞬时类，供调用方决定降级策略。
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}
