use chrono::{DateTime, Duration, Utc};

/// # Summary
/// 将时间戳截断到所在分钟的起点。
///
/// # Logic
/// 1. 取 Unix 秒并去掉 60 秒内的余数，亚秒部分随之归零。
///
/// # Arguments
/// * `t`: 任意 UTC 时间。
///
/// # Returns
/// 分钟对齐后的 UTC 时间。
pub fn floor_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    floor_to_bar(t, 60)
}

/// # Summary
/// 将时间戳截断到所在 K 线周期的起点。
///
/// # Logic
/// 1. 以 Unix 纪元为基准，按周期秒数做整除对齐。
/// 2. 小时及以上周期因此天然对齐到 UTC 整点/整日。
///
/// # Arguments
/// * `t`: 任意 UTC 时间。
/// * `bar_seconds`: 周期覆盖的秒数，必须为正。
///
/// # Returns
/// 周期对齐后的 UTC 时间。
pub fn floor_to_bar(t: DateTime<Utc>, bar_seconds: i64) -> DateTime<Utc> {
    let secs = t.timestamp();
    let aligned = secs - secs.rem_euclid(bar_seconds);
    // rem_euclid 保证了纪元前时间也向下取整
    DateTime::from_timestamp(aligned, 0).unwrap_or(t)
}

/// # Summary
/// 计算严格晚于给定时间的下一个分钟边界。
///
/// # Logic
/// 1. 先对齐到当前分钟起点，再前进一分钟。
/// 2. 即使输入本身已对齐，也返回下一分钟，供定时器循环使用。
///
/// # Arguments
/// * `t`: 任意 UTC 时间。
///
/// # Returns
/// 下一个分钟边界。
pub fn next_minute_boundary(t: DateTime<Utc>) -> DateTime<Utc> {
    floor_to_minute(t) + Duration::seconds(60)
}

/// # Summary
/// 判断时间戳是否分钟对齐（秒与亚秒均为零）。
///
/// # Arguments
/// * `t`: 待检时间。
///
/// # Returns
/// 对齐返回 true。
pub fn is_minute_aligned(t: DateTime<Utc>) -> bool {
    floor_to_minute(t) == t
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }

    #[test]
    fn test_floor_to_minute_drops_seconds() {
        let t = at("2026-03-01T12:34:58.731Z");
        assert_eq!(floor_to_minute(t), at("2026-03-01T12:34:00Z"));
        assert!(is_minute_aligned(floor_to_minute(t)));
    }

    #[test]
    fn test_floor_to_minute_is_idempotent() {
        let t = at("2026-03-01T12:34:00Z");
        assert_eq!(floor_to_minute(t), t);
    }

    #[test]
    fn test_floor_to_bar_hourly() {
        let t = at("2026-03-01T12:34:58Z");
        assert_eq!(floor_to_bar(t, 3600), at("2026-03-01T12:00:00Z"));
        assert_eq!(floor_to_bar(t, 4 * 3600), at("2026-03-01T12:00:00Z"));
        assert_eq!(floor_to_bar(t, 86400), at("2026-03-01T00:00:00Z"));
    }

    #[test]
    fn test_next_minute_boundary_strictly_advances() {
        let aligned = at("2026-03-01T12:34:00Z");
        assert_eq!(next_minute_boundary(aligned), at("2026-03-01T12:35:00Z"));
        let mid = at("2026-03-01T12:34:31Z");
        assert_eq!(next_minute_boundary(mid), at("2026-03-01T12:35:00Z"));
    }
}
