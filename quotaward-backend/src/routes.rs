use crate::AppState;
use crate::error::AppError;
use crate::middleware::ClientIp;
use crate::playtime::{LoginAttempt, PlaytimeRecord, PlaytimeSettings};
use crate::settings::{parse_graphics_options, parse_misc_options};
use crate::validation;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use axum_extra::TypedHeader;
use axum_macros::debug_handler;
use headers::Authorization;
use headers::authorization::Bearer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Deserialize)]
pub(crate) struct LoginRequest {
    #[serde(rename = "deviceID")]
    device_id: String,
    #[serde(rename = "realDeviceID", default)]
    real_device_id: String,
    #[serde(rename = "deviceInfo", default)]
    device_info: String,
}

#[derive(Deserialize)]
pub(crate) struct HeartbeatRequest {
    #[serde(rename = "deviceID")]
    device_id: String,
}

#[derive(Deserialize)]
pub(crate) struct BonusRequest {
    #[serde(rename = "deviceIDs")]
    device_ids: Vec<String>,
    seconds: i64,
}

#[derive(Deserialize)]
pub(crate) struct VipRequest {
    #[serde(rename = "deviceID")]
    device_id: String,
    #[serde(rename = "isVIP")]
    is_vip: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PlaytimeResponse {
    played_time: i64,
    #[serde(rename = "isVIP")]
    is_vip: bool,
    daily_play_time: i64,
    today_extra_time: i64,
    remaining_time: i64,
    in_session: bool,
}

impl From<PlaytimeRecord> for PlaytimeResponse {
    fn from(record: PlaytimeRecord) -> Self {
        Self {
            played_time: record.played_time,
            is_vip: record.is_vip,
            daily_play_time: record.daily_play_time,
            today_extra_time: record.today_extra_time,
            remaining_time: record.remaining_time(),
            in_session: record.in_session(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SettingsResponse {
    graphics_options: Vec<Map<String, Value>>,
    misc_options: Map<String, Value>,
    #[serde(rename = "serverIP")]
    server_ip: Option<String>,
    server_port: Option<String>,
    server_over_day_timestamp: i64,
    playtime: PlaytimeSettings,
    updated_at: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BonusResponse {
    granted: usize,
    requested: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

/// Reject any identifier on a ban list with the same vague error as a banned IP.
fn ensure_not_banned(state: &AppState, device_id: &str, real_device_id: &str, device_info: &str) -> Result<(), AppError> {
    let engine = &state.engine;
    if engine.check_device_id_banned(device_id)
        || engine.check_real_device_id_banned(real_device_id)
        || engine.check_device_info_banned(device_info)
    {
        warn!(%device_id, "rejected banned device");
        return Err(AppError::Banned);
    }
    Ok(())
}

fn authorize_admin(state: &AppState, auth: Option<TypedHeader<Authorization<Bearer>>>) -> Result<(), AppError> {
    match (&state.admin_token, auth) {
        (Some(expected), Some(TypedHeader(auth))) if auth.token() == expected => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}

#[debug_handler]
pub(crate) async fn login(
    State(state): State<Arc<AppState>>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Json(payload): Json<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_device_id(&payload.device_id)?;
    ensure_not_banned(
        &state,
        &payload.device_id,
        &payload.real_device_id,
        &payload.device_info,
    )?;

    let attempt = LoginAttempt {
        device_id: &payload.device_id,
        ip: &ip,
        real_device_id: &payload.real_device_id,
        device_info: &payload.device_info,
    };
    let record = state.engine.verify_and_authorize_login(&attempt).await?;

    Ok((StatusCode::OK, Json(PlaytimeResponse::from(record))))
}

#[debug_handler]
pub(crate) async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_device_id(&payload.device_id)?;
    ensure_not_banned(&state, &payload.device_id, "", "")?;

    let record = state.engine.consume_elapsed(&payload.device_id).await?;

    Ok((StatusCode::OK, Json(PlaytimeResponse::from(record))))
}

#[debug_handler]
pub(crate) async fn playtime(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_device_id(&device_id)?;

    let record = state.engine.get_or_create_playtime(&device_id).await?;

    Ok((StatusCode::OK, Json(PlaytimeResponse::from(record))))
}

#[debug_handler]
pub(crate) async fn settings(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let settings = state.engine.get_settings();

    Json(SettingsResponse {
        graphics_options: parse_graphics_options(&settings.graphics_options),
        misc_options: parse_misc_options(&settings.misc_options),
        server_ip: settings.server_ip.clone(),
        server_port: settings.server_port.clone(),
        server_over_day_timestamp: settings.server_over_day_timestamp,
        playtime: settings.playtime,
        updated_at: settings.updated_at,
    })
}

#[debug_handler]
pub(crate) async fn grant_bonus(
    State(state): State<Arc<AppState>>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    Json(payload): Json<BonusRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize_admin(&state, auth)?;
    validation::validate_device_list(&payload.device_ids)?;
    validation::validate_bonus_seconds(payload.seconds)?;

    let mut report = state
        .engine
        .grant_bonus_many(&payload.device_ids, payload.seconds)
        .await;

    // Nothing granted: surface the failure itself
    if report.granted == 0
        && let Some(error) = report.last_error.take()
    {
        return Err(error.into());
    }

    info!(
        granted = report.granted,
        seconds = payload.seconds,
        "admin granted bonus playtime"
    );
    Ok((
        StatusCode::OK,
        Json(BonusResponse {
            granted: report.granted,
            requested: payload.device_ids.len(),
            last_error: report.last_error.as_ref().map(ToString::to_string),
        }),
    ))
}

#[debug_handler]
pub(crate) async fn set_vip(
    State(state): State<Arc<AppState>>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    Json(payload): Json<VipRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize_admin(&state, auth)?;
    validation::validate_device_id(&payload.device_id)?;

    let record = state
        .engine
        .set_vip(&payload.device_id, payload.is_vip)
        .await?;

    Ok((StatusCode::OK, Json(PlaytimeResponse::from(record))))
}
