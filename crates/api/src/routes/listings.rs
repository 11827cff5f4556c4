use crate::server::AppState;
use crate::types::SeriesListingDto;
use axum::Json;
use axum::extract::State;

/// 枚举全部已知序列
///
/// 返回参照表中登记的每条序列（含停用项），按序列标识升序。
#[utoipa::path(
    get,
    path = "/api/v1/starlistings",
    tag = "行情 (Market)",
    responses(
        (status = 200, description = "枚举成功", body = Vec<SeriesListingDto>)
    )
)]
pub async fn get_starlistings(State(state): State<AppState>) -> Json<Vec<SeriesListingDto>> {
    Json(
        state
            .resolver
            .all_series()
            .iter()
            .map(Into::into)
            .collect(),
    )
}
