//! Operator HTTP API.
//!
//! Reads come from the incident journal. Writes never touch the engine
//! directly: they are queued as [`OperatorCommand`]s and applied by the
//! frame loop between frames.
//!
//! - `GET /health` - Health check
//! - `GET /incidents?state=` - List journaled incidents
//! - `GET /incidents/:id` - One incident with its notification log
//! - `POST /incidents/:id/resolve` - Ask the frame loop to resolve an incident

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::model::{Incident, IncidentState};
use crate::storage::{NotificationRecord, Storage};

/// Commands consumed by the frame loop.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    Resolve { incident_id: String },
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub commands: mpsc::Sender<OperatorCommand>,
}

#[derive(Debug, Deserialize)]
pub struct IncidentsQuery {
    /// tentative | confirmed | resolved
    pub state: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IncidentsResponse {
    pub count: usize,
    pub incidents: Vec<Incident>,
}

#[derive(Debug, Serialize)]
pub struct IncidentDetail {
    #[serde(flatten)]
    pub incident: Incident,
    pub notifications: Vec<NotificationRecord>,
}

#[derive(Debug, Serialize)]
pub struct ResolveAccepted {
    pub incident_id: String,
    pub status: &'static str,
}

/// Build the router with request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/incidents", get(list_incidents))
        .route("/incidents/:id", get(get_incident))
        .route("/incidents/:id/resolve", post(resolve_incident))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// GET /incidents - List incidents, optionally filtered by state.
#[instrument(skip(state))]
pub async fn list_incidents(
    State(state): State<AppState>,
    Query(query): Query<IncidentsQuery>,
) -> Result<Json<IncidentsResponse>> {
    let filter = query
        .state
        .as_deref()
        .map(str::parse::<IncidentState>)
        .transpose()
        .map_err(Error::InvalidRequest)?;

    let incidents = state.storage.list_incidents(filter).await?;
    info!(count = incidents.len(), state = ?filter, "Incidents queried");

    Ok(Json(IncidentsResponse {
        count: incidents.len(),
        incidents,
    }))
}

/// GET /incidents/:id - Incident plus its delivery log.
#[instrument(skip(state))]
pub async fn get_incident(
    State(state): State<AppState>,
    Path(incident_id): Path<String>,
) -> Result<Json<IncidentDetail>> {
    let incident = state
        .storage
        .get_incident(&incident_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("incident {incident_id}")))?;
    let notifications = state.storage.notifications_for(&incident_id).await?;

    Ok(Json(IncidentDetail {
        incident,
        notifications,
    }))
}

/// POST /incidents/:id/resolve - Queue a manual resolution.
///
/// Returns `202 Accepted` once the command is queued; the frame loop applies
/// it before its next frame. Already resolved incidents are accepted as a
/// no-op.
#[instrument(skip(state))]
pub async fn resolve_incident(
    State(state): State<AppState>,
    Path(incident_id): Path<String>,
) -> Result<(StatusCode, Json<ResolveAccepted>)> {
    if state.storage.get_incident(&incident_id).await?.is_none() {
        return Err(Error::NotFound(format!("incident {incident_id}")));
    }

    state
        .commands
        .send(OperatorCommand::Resolve {
            incident_id: incident_id.clone(),
        })
        .await
        .map_err(|_| Error::LoopUnavailable)?;

    info!(incident_id = %incident_id, "Manual resolution queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(ResolveAccepted {
            incident_id,
            status: "accepted",
        }),
    ))
}
