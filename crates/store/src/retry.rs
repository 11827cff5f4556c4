use rand::RngExt;
use souba_core::store::error::StoreError;
use std::time::Duration;

/// 瞬时故障的最大重试次数（首次尝试之外）。
pub(crate) const MAX_ATTEMPTS: u32 = 3;

/// 重试退避基数。
const BASE_BACKOFF: Duration = Duration::from_millis(100);

/// # Summary
/// 将 sqlx 错误归类到存储层错误分类。
///
/// # Logic
/// 1. 连接中断、池超时、协议层 IO 视为瞬时，交由上层重试。
/// 2. 死锁 (40P01)、序列化冲突 (40001)、管理员断连 (57P01) 同样瞬时。
/// 3. 约束类 (23xxx) 归为校验错误，永不重试。
/// 4. 其余一律视为非瞬时数据库错误。
///
/// # Arguments
/// * `e`: 底层 sqlx 错误。
///
/// # Returns
/// 分类后的 StoreError。
pub(crate) fn classify(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Protocol(_) => StoreError::Transient(e.to_string()),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("40P01") | Some("40001") | Some("57P01") => {
                StoreError::Transient(e.to_string())
            }
            Some(code) if code.starts_with("23") => StoreError::Validation(e.to_string()),
            _ => StoreError::Database(e.to_string()),
        },
        sqlx::Error::RowNotFound => StoreError::NotFound,
        _ => StoreError::Database(e.to_string()),
    }
}

/// # Summary
/// 计算第 `attempt` 次重试前的抖动退避时长。
///
/// # Logic
/// 1. 指数增长：base · 2^attempt。
/// 2. 乘以 [0.5, 1.5) 均匀抖动，避免并发重试同相。
///
/// # Arguments
/// * `attempt`: 从 0 起的失败次数。
///
/// # Returns
/// 退避时长。
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_BACKOFF.saturating_mul(1u32 << attempt.min(6));
    exp.mul_f64(rand::rng().random_range(0.5..1.5))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_is_transient() {
        let e = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(classify(e).is_transient());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(classify(sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        assert!(matches!(
            classify(sqlx::Error::RowNotFound),
            StoreError::NotFound
        ));
    }

    #[test]
    fn test_backoff_grows_with_attempts_and_stays_bounded() {
        for attempt in 0..10 {
            let d = backoff_delay(attempt);
            // 最大指数 2^6，抖动上界 1.5 倍
            assert!(d <= Duration::from_millis(100 * 64 * 2));
            assert!(d >= Duration::from_millis(25));
        }
    }
}
