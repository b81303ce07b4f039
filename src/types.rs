// src/types.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ==============================================================================
// 1. 运行时核心数据 (Alert)
// ==============================================================================

/// 一条活动中的报警。`alert_id` 是全局身份 (路由/房间都用它)，
/// `id` 只是本地展示用的 key。
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub id: String,
    pub alert_id: String,
    pub lat: f64,
    pub lng: f64,
    pub emitter_name: String,
    pub emitter_phone: String,
    pub emitter_id: String,
    pub reported_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn from_wire(payload: AlertReceivedPayload) -> Self {
        // 线路坐标顺序是 [lng, lat]，这里翻转成命名字段
        let (lat, lng) = named_coords(payload.coordinates);
        Self {
            id: Uuid::new_v4().to_string(),
            alert_id: payload.alert_id,
            lat,
            lng,
            emitter_name: payload.emitter_name.unwrap_or_default(),
            emitter_phone: payload.emitter_phone.unwrap_or_default(),
            emitter_id: payload.emitter_id.unwrap_or_default(),
            reported_at: payload.reported_at,
        }
    }
}

/// `[lng, lat]` -> `(lat, lng)`
pub fn named_coords(coordinates: [f64; 2]) -> (f64, f64) {
    (coordinates[1], coordinates[0])
}

// ==============================================================================
// 2. 线路信封与推送 Payload
// ==============================================================================

/// 所有文本帧统一为 `{ "event": <name>, "data": {...} }`
#[derive(Debug, Deserialize, Serialize)]
pub struct WireEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AlertReceivedPayload {
    pub alert_id: String,
    pub coordinates: [f64; 2],
    pub emitter_name: Option<String>,
    pub emitter_phone: Option<String>,
    pub emitter_id: Option<String>,
    pub reported_at: Option<DateTime<Utc>>,
}

/// attended / finalized 事件只关心 alertId
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AlertIdPayload {
    pub alert_id: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdatePayload {
    pub alert_id: String,
    pub coordinates: [f64; 2],
}

// ==============================================================================
// 3. 出站指令
// ==============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomCommand {
    pub room: String,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AttendCommand {
    pub alert_id: String,
    pub user_id: String,
    pub recipient_id: String,
}

// ==============================================================================
// 4. REST 轮询响应 (GET /alerts/{alertId})
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct AlertDetailResponse {
    pub alert: AlertDetail,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertDetail {
    pub last_location: GeoPoint,
    pub reporter: Reporter,
}

#[derive(Debug, Deserialize)]
pub struct GeoPoint {
    pub coordinates: [f64; 2],
}

#[derive(Debug, Deserialize)]
pub struct Reporter {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub id: Option<String>,
}

/// 轮询结果的扁平化快照，写入视图前的统一形状
#[derive(Debug, Clone)]
pub struct TrackedSnapshot {
    pub lat: f64,
    pub lng: f64,
    pub reporter_name: String,
    pub reporter_phone: String,
    pub reporter_id: String,
}

impl From<AlertDetailResponse> for TrackedSnapshot {
    fn from(body: AlertDetailResponse) -> Self {
        let (lat, lng) = named_coords(body.alert.last_location.coordinates);
        Self {
            lat,
            lng,
            reporter_name: body.alert.reporter.name.unwrap_or_default(),
            reporter_phone: body.alert.reporter.phone.unwrap_or_default(),
            reporter_id: body.alert.reporter.id.unwrap_or_default(),
        }
    }
}
