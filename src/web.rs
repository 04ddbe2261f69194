//! HTTP control plane: status snapshot, valve/mode commands, schedule CRUD,
//! and threshold administration. Thin by design; every decision lives in
//! the controller.

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::db::{Db, NewSchedule, SchedulePatch, ThresholdPatch};
use crate::state::{Mode, SharedState};
use crate::valve::Actuator;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub db: Db,
    pub actuator: Actuator,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/valve", post(valve_command))
        .route("/api/mode", post(mode_command))
        .route("/api/thresholds", get(get_thresholds).put(put_thresholds))
        .route("/api/schedules", get(list_schedules).post(create_schedule))
        .route(
            "/api/schedules/{id}",
            put(update_schedule).delete(delete_schedule),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

async fn status(State(app): State<AppState>) -> Response {
    let st = app.shared.read().await;
    Json(st.to_status()).into_response()
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ValveCommand {
    action: String,
    seconds: Option<u64>,
}

async fn valve_command(
    State(app): State<AppState>,
    Json(cmd): Json<ValveCommand>,
) -> Response {
    match cmd.action.as_str() {
        "open" => {
            // Timed opening only exists on the timed actuator variant.
            match (&app.actuator, cmd.seconds) {
                (Actuator::Timed(v), Some(seconds)) => v.open_for(seconds),
                (actuator, _) => actuator.open(),
            }
            app.shared.write().await.set_valve_open(true);
            Json(json!({ "ok": true })).into_response()
        }
        "close" => {
            app.actuator.close();
            app.shared.write().await.set_valve_open(false);
            Json(json!({ "ok": true })).into_response()
        }
        other => bad_request(format!("unknown valve action '{other}'")),
    }
}

#[derive(Debug, Deserialize)]
struct ModeCommand {
    mode: String,
}

async fn mode_command(State(app): State<AppState>, Json(cmd): Json<ModeCommand>) -> Response {
    let Some(mode) = Mode::parse(&cmd.mode) else {
        return bad_request(format!("unknown mode '{}'", cmd.mode));
    };
    app.shared.write().await.set_mode(mode);
    Json(json!({ "ok": true, "mode": mode.as_str() })).into_response()
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

async fn get_thresholds(State(app): State<AppState>) -> Response {
    match app.db.current_thresholds().await {
        Ok(t) => Json(t).into_response(),
        Err(e) => internal(e),
    }
}

async fn put_thresholds(
    State(app): State<AppState>,
    Json(patch): Json<ThresholdPatch>,
) -> Response {
    let mut merged = match app.db.current_thresholds().await {
        Ok(t) => t,
        Err(e) => return internal(e),
    };
    patch.apply(&mut merged);

    if let Err(e) = merged.validate() {
        return bad_request(format!("{e:#}"));
    }
    if let Err(e) = app.db.store_thresholds(&merged).await {
        return internal(e);
    }
    Json(merged).into_response()
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

async fn list_schedules(State(app): State<AppState>) -> Response {
    match app.db.list_schedules().await {
        Ok(all) => Json(all).into_response(),
        Err(e) => internal(e),
    }
}

async fn create_schedule(
    State(app): State<AppState>,
    Json(new): Json<NewSchedule>,
) -> Response {
    // Validate through a throwaway entry so create/update share the rules.
    let candidate = crate::db::ScheduleEntry {
        id: 0,
        name: new.name.clone(),
        date: new.date,
        hour: new.hour,
        minute: new.minute,
        duration_sec: new.duration_sec,
        enabled: new.enabled,
    };
    if let Err(e) = candidate.validate() {
        return bad_request(format!("{e:#}"));
    }

    match app.db.create_schedule(&new).await {
        Ok(entry) => (StatusCode::CREATED, Json(entry)).into_response(),
        Err(e) => internal(e),
    }
}

async fn update_schedule(
    State(app): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<SchedulePatch>,
) -> Response {
    let mut entry = match app.db.get_schedule(id).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return not_found(),
        Err(e) => return internal(e),
    };
    patch.apply(&mut entry);

    if let Err(e) = entry.validate() {
        return bad_request(format!("{e:#}"));
    }
    if let Err(e) = app.db.replace_schedule(&entry).await {
        return internal(e);
    }
    Json(entry).into_response()
}

async fn delete_schedule(State(app): State<AppState>, Path(id): Path<i64>) -> Response {
    match app.db.delete_schedule(id).await {
        Ok(true) => Json(json!({ "ok": true, "id": id })).into_response(),
        Ok(false) => not_found(),
        Err(e) => internal(e),
    }
}

// ---------------------------------------------------------------------------
// Error responses
// ---------------------------------------------------------------------------

fn bad_request(msg: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "schedule not found" })),
    )
        .into_response()
}

fn internal(e: anyhow::Error) -> Response {
    tracing::error!("api error: {e:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(app: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("control api listening on http://{addr}");

    axum::serve(listener, router(app))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SystemState;
    use crate::valve::{MockValve, TimedValve, Valve};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::Arc;
    use time::macros::date;
    use tokio::sync::RwLock;
    use tower::util::ServiceExt;

    struct Rig {
        router: Router,
        shared: SharedState,
        valve: Arc<MockValve>,
    }

    async fn rig() -> Rig {
        rig_with_actuator(|v| Actuator::Basic(v)).await
    }

    async fn rig_with_actuator(make: impl Fn(Arc<dyn Valve>) -> Actuator) -> Rig {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let valve = Arc::new(MockValve::new());
        let shared: SharedState =
            Arc::new(RwLock::new(SystemState::new(date!(2024 - 05 - 10))));

        let router = router(AppState {
            shared: shared.clone(),
            db,
            actuator: make(valve.clone()),
        });

        Rig {
            router,
            shared,
            valve,
        }
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
        let request = match body {
            Some(b) => Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    // -- Status -----------------------------------------------------------

    #[tokio::test]
    async fn status_returns_snapshot() {
        let r = rig().await;
        let (status, json) = send(&r.router, "GET", "/api/status", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["mode"], "auto");
        assert_eq!(json["controller_state"], "idle");
        assert_eq!(json["valve_open"], false);
        assert_eq!(json["daily_watered_seconds"], 0);
        assert!(json["events"].is_array());
    }

    // -- Valve commands ---------------------------------------------------

    #[tokio::test]
    async fn valve_open_and_close() {
        let r = rig().await;

        let (status, _) = send(&r.router, "POST", "/api/valve", Some(r#"{"action":"open"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(r.valve.is_open());
        assert!(r.shared.read().await.snapshot().valve_open);

        let (status, _) =
            send(&r.router, "POST", "/api/valve", Some(r#"{"action":"close"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!r.valve.is_open());
        assert!(!r.shared.read().await.snapshot().valve_open);
    }

    #[tokio::test]
    async fn unknown_valve_action_rejected() {
        let r = rig().await;
        let (status, json) =
            send(&r.router, "POST", "/api/valve", Some(r#"{"action":"toggle"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("toggle"));
        assert!(!r.valve.is_open());
    }

    #[tokio::test]
    async fn timed_actuator_accepts_seconds() {
        let r = rig_with_actuator(|v| Actuator::Timed(TimedValve::new(v))).await;
        let (status, _) = send(
            &r.router,
            "POST",
            "/api/valve",
            Some(r#"{"action":"open","seconds":30}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(r.valve.is_open());
    }

    #[tokio::test]
    async fn basic_actuator_ignores_seconds() {
        let r = rig().await;
        let (status, _) = send(
            &r.router,
            "POST",
            "/api/valve",
            Some(r#"{"action":"open","seconds":30}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(r.valve.is_open());
    }

    // -- Mode commands ----------------------------------------------------

    #[tokio::test]
    async fn mode_switch_roundtrip() {
        let r = rig().await;

        let (status, json) = send(&r.router, "POST", "/api/mode", Some(r#"{"mode":"manual"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["mode"], "manual");
        assert_eq!(r.shared.read().await.snapshot().mode, Mode::Manual);

        let (status, _) = send(&r.router, "POST", "/api/mode", Some(r#"{"mode":"auto"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(r.shared.read().await.snapshot().mode, Mode::Auto);
    }

    #[tokio::test]
    async fn unknown_mode_rejected() {
        let r = rig().await;
        let (status, json) = send(&r.router, "POST", "/api/mode", Some(r#"{"mode":"off"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("off"));
    }

    // -- Thresholds -------------------------------------------------------

    #[tokio::test]
    async fn thresholds_get_returns_defaults() {
        let r = rig().await;
        let (status, json) = send(&r.router, "GET", "/api/thresholds", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["moisture_low"], 0.38);
        assert_eq!(json["moisture_high"], 0.45);
        assert_eq!(json["watering_sec"], 90);
    }

    #[tokio::test]
    async fn thresholds_partial_update() {
        let r = rig().await;
        let (status, json) = send(
            &r.router,
            "PUT",
            "/api/thresholds",
            Some(r#"{"moisture_low":0.30,"soak_min":12}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["moisture_low"], 0.3);
        assert_eq!(json["soak_min"], 12);
        assert_eq!(json["moisture_high"], 0.45);

        // Persisted: a fresh GET sees the update.
        let (_, json) = send(&r.router, "GET", "/api/thresholds", None).await;
        assert_eq!(json["moisture_low"], 0.3);
    }

    #[tokio::test]
    async fn invalid_threshold_update_rejected() {
        let r = rig().await;
        // Low above the current high violates the ordering invariant.
        let (status, json) = send(
            &r.router,
            "PUT",
            "/api/thresholds",
            Some(r#"{"moisture_low":0.90}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"]
            .as_str()
            .unwrap()
            .contains("must be greater than moisture_low"));

        // Nothing was stored.
        let (_, json) = send(&r.router, "GET", "/api/thresholds", None).await;
        assert_eq!(json["moisture_low"], 0.38);
    }

    // -- Schedules --------------------------------------------------------

    const SCHEDULE: &str =
        r#"{"name":"morning","date":"2024-05-10","hour":6,"minute":30,"duration_sec":120}"#;

    #[tokio::test]
    async fn schedule_create_and_list() {
        let r = rig().await;

        let (status, created) = send(&r.router, "POST", "/api/schedules", Some(SCHEDULE)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["name"], "morning");
        assert_eq!(created["date"], "2024-05-10");
        assert_eq!(created["enabled"], true);

        let (status, list) = send(&r.router, "GET", "/api/schedules", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn schedule_invalid_create_rejected() {
        let r = rig().await;
        let bad = r#"{"name":"","date":"2024-05-10","hour":25,"minute":0,"duration_sec":0}"#;
        let (status, json) = send(&r.router, "POST", "/api/schedules", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let msg = json["error"].as_str().unwrap();
        assert!(msg.contains("name is empty"), "{msg}");
        assert!(msg.contains("hour 25"), "{msg}");
    }

    #[tokio::test]
    async fn schedule_update_and_toggle() {
        let r = rig().await;
        let (_, created) = send(&r.router, "POST", "/api/schedules", Some(SCHEDULE)).await;
        let id = created["id"].as_i64().unwrap();

        let (status, updated) = send(
            &r.router,
            "PUT",
            &format!("/api/schedules/{id}"),
            Some(r#"{"minute":45,"enabled":false}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["minute"], 45);
        assert_eq!(updated["enabled"], false);
        assert_eq!(updated["hour"], 6);
    }

    #[tokio::test]
    async fn schedule_update_unknown_id_404() {
        let r = rig().await;
        let (status, _) = send(
            &r.router,
            "PUT",
            "/api/schedules/999",
            Some(r#"{"minute":5}"#),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn schedule_delete() {
        let r = rig().await;
        let (_, created) = send(&r.router, "POST", "/api/schedules", Some(SCHEDULE)).await;
        let id = created["id"].as_i64().unwrap();

        let (status, json) =
            send(&r.router, "DELETE", &format!("/api/schedules/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], true);

        let (status, _) = send(&r.router, "DELETE", &format!("/api/schedules/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
