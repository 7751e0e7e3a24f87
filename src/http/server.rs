use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use super::{NegotiationRequest, NegotiationResponse, ResponseStatus};
use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::negotiation::{Inbound, Negotiator, Outcome, Silence};
use crate::options::MessageType;

type ApiError = (StatusCode, String);

/// Routes for the HTTP transport over a shared [`Negotiator`].
pub fn router(negotiator: Arc<Negotiator>) -> Router {
    Router::new()
        .route("/", post(negotiate))
        .route("/leases", get(list_leases))
        .with_state(negotiator)
}

/// Serves the HTTP transport on `addr` until the listener fails.
pub async fn serve(negotiator: Arc<Negotiator>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|error| Error::Socket(format!("Failed to bind to {}: {}", addr, error)))?;

    info!("HTTP transport listening on {}", listener.local_addr()?);

    axum::serve(listener, router(negotiator)).await?;
    Ok(())
}

async fn negotiate(
    State(negotiator): State<Arc<Negotiator>>,
    Json(request): Json<NegotiationRequest>,
) -> std::result::Result<Json<NegotiationResponse>, ApiError> {
    let kind = MessageType::from(request.kind);
    info!("{} from {} over HTTP", kind, request.client_id);

    let mut inbound = Inbound::new(kind, request.client_id.clone());
    match kind {
        MessageType::Release => {
            if let Some(address) = request.requested_address {
                inbound.client_address = address;
            }
        }
        _ => inbound.requested = request.requested_address,
    }

    let outcome = negotiator.handle(inbound).await.map_err(|error| {
        error!("{} from {} failed: {}", kind, request.client_id, error);
        (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
    })?;

    let response = match outcome {
        Outcome::Offer(grant) => NegotiationResponse {
            status: ResponseStatus::Offer,
            address: Some(grant.address),
            lease_duration_seconds: grant.lease_seconds,
        },
        Outcome::Ack(grant) => NegotiationResponse {
            status: ResponseStatus::Ack,
            address: Some(grant.address),
            lease_duration_seconds: grant.lease_seconds,
        },
        Outcome::Released(address) => NegotiationResponse {
            status: ResponseStatus::Released,
            address: Some(address),
            lease_duration_seconds: 0,
        },
        Outcome::Nak => {
            return Err((StatusCode::BAD_REQUEST, "NAK: address rejected".to_string()));
        }
        Outcome::Silent(Silence::Exhausted) => {
            return Err((
                StatusCode::SERVICE_UNAVAILABLE,
                "address pool exhausted".to_string(),
            ));
        }
        Outcome::Silent(reason) => {
            warn!("{} from {} not applied: {:?}", kind, request.client_id, reason);
            return Err((
                StatusCode::CONFLICT,
                format!("{} does not apply to the current negotiation", kind),
            ));
        }
    };

    Ok(Json(response))
}

async fn list_leases(
    State(negotiator): State<Arc<Negotiator>>,
) -> std::result::Result<Json<Vec<Lease>>, ApiError> {
    negotiator
        .table()
        .leases()
        .await
        .map(Json)
        .map_err(|error| (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()))
}
