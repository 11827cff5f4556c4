use thiserror::Error;

/// # Summary
/// 行情采集域错误枚举，覆盖连接、解析、限速与数据缺失等问题。
///
/// # Invariants
/// - 必须通过 `thiserror` 派生 `Error` trait。
#[derive(Error, Debug)]
pub enum FeedError {
    // 网络层错误，包含底层 WebSocket / HTTP 客户端错误信息
    #[error("Network error: {0}")]
    Network(String),
    // 单帧解析错误，调用方应跳过该帧而非中断连接
    #[error("Parse error: {0}")]
    Parse(String),
    // 上游限速 (HTTP 429 或等价信号)
    #[error("Rate limited by upstream")]
    RateLimited,
    // 请求的数据未找到或内容为空
    #[error("Data not found")]
    NotFound,
    // 该交易所不支持请求的数据种类
    #[error("Unsupported data kind: {0}")]
    Unsupported(String),
    // 未知或未分类的错误
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl FeedError {
    /// 判定该错误是否值得在退避后重试（网络与限速类）。
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::Network(_) | FeedError::RateLimited)
    }
}
