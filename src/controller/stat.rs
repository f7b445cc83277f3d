use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use serde::Deserialize;

use super::error::RelayError;
use crate::database::stat::{HourFilter, ModelHealthHourly, ModelHealthRank, UserCallRank};
use crate::service::aggregator::validate_query;
use crate::service::app_state::{create_state_router, AppState, StateRouter};
use crate::utils::HttpResult;

#[derive(Deserialize, Debug, Default)]
pub struct StatParams {
    /// Unix seconds, hour aligned.
    start: Option<i64>,
    end: Option<i64>,
    /// Comma separated hour starts; wins over `start`/`end`.
    hours: Option<String>,
    limit: Option<usize>,
    model: Option<String>,
}

impl StatParams {
    fn filter(&self) -> Result<HourFilter, RelayError> {
        if let Some(hours) = self.hours.as_deref().filter(|h| !h.is_empty()) {
            let list = hours
                .split(',')
                .map(|h| h.trim().parse::<i64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| RelayError::invalid_request("hours must be a comma separated list of timestamps").with_param("hours"))?;
            return Ok(HourFilter::List(list));
        }
        match (self.start, self.end) {
            (Some(start), Some(end)) => Ok(HourFilter::Range { start, end }),
            _ => Err(RelayError::invalid_request("start and end, or hours, are required")),
        }
    }

    fn checked(&self) -> Result<(HourFilter, usize), RelayError> {
        let filter = self.filter()?;
        let limit = validate_query(&filter, self.limit).map_err(RelayError::invalid_request)?;
        Ok((filter, limit))
    }
}

async fn user_calls(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatParams>,
) -> Result<HttpResult<Vec<UserCallRank>>, RelayError> {
    let (filter, limit) = params.checked()?;
    Ok(HttpResult::new(state.store.query_user_calls(&filter, limit)?))
}

async fn model_health(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatParams>,
) -> Result<HttpResult<Vec<ModelHealthRank>>, RelayError> {
    let (filter, limit) = params.checked()?;
    Ok(HttpResult::new(state.store.query_model_health(&filter, limit)?))
}

async fn model_health_hourly(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatParams>,
) -> Result<HttpResult<Vec<ModelHealthHourly>>, RelayError> {
    let (filter, _) = params.checked()?;
    let rows = state.store.query_model_health_hourly(&filter, params.model.as_deref())?;
    Ok(HttpResult::new(rows))
}

pub fn routes() -> StateRouter {
    create_state_router().nest(
        "/stat",
        create_state_router()
            .route("/user_calls", get(user_calls))
            .route("/model_health", get(model_health))
            .route("/model_health/hourly", get(model_health_hourly)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_list_wins_over_range() {
        let params = StatParams { start: Some(0), end: Some(3600), hours: Some("3600, 7200".into()), ..Default::default() };
        assert_eq!(params.filter().unwrap(), HourFilter::List(vec![3600, 7200]));
        let params = StatParams { start: Some(0), end: Some(3600), ..Default::default() };
        assert_eq!(params.filter().unwrap(), HourFilter::Range { start: 0, end: 3600 });
        assert!(StatParams::default().filter().is_err());
        let bad = StatParams { hours: Some("x".into()), ..Default::default() };
        assert_eq!(bad.filter().unwrap_err().param.as_deref(), Some("hours"));
    }

    #[test]
    fn oversized_range_is_rejected() {
        let params = StatParams { start: Some(0), end: Some(40 * 24 * 3600), ..Default::default() };
        assert!(params.checked().is_err());
    }
}
