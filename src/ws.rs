//! WebSocket transport adapter.
//!
//! Each connection gets a session task owning the socket: one side drains
//! the outbound queue the dispatcher feeds, the other processes inbound
//! subscribe/unsubscribe/ping requests. A subscribe is acknowledged, then
//! answered with an `initial_data` snapshot, and only then registered live,
//! so no `instrument_update` precedes its snapshot. Disconnect detaches the
//! session from the registry; anything still queued is dropped silently.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::error::CoreError;
use crate::filter::Predicate;
use crate::models::{ClientMessage, ServerMessage, SubscribeRequest};
use crate::subscriptions::{SessionId, Subscription};

/// Upgrade handler for `GET /ws`.
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let session_id: SessionId = Uuid::new_v4();
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<ServerMessage>(state.config.outbound_queue_size);
    state.registry.register(session_id, outbound_tx);
    info!(%session_id, "blotter client connected");

    let mut shutdown = state.shutdown.clone();
    loop {
        tokio::select! {
            Some(message) = outbound_rx.recv() => {
                if send_json(&mut socket, &message).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if handle_client_message(&mut socket, &state, &session_id, &text)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary/ping/pong frames ignored
                    Some(Err(e)) => {
                        debug!(%session_id, error = %e, "websocket receive error");
                        break;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(%session_id, "closing session for shutdown");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    state.registry.unregister(&session_id);
    info!(%session_id, "blotter client disconnected");
}

async fn handle_client_message(
    socket: &mut WebSocket,
    state: &AppState,
    session_id: &SessionId,
    text: &str,
) -> Result<(), axum::Error> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe(request)) => {
            handle_subscribe(socket, state, session_id, request).await
        }
        Ok(ClientMessage::Unsubscribe { subscription_id }) => {
            let response = match state
                .registry
                .remove_subscription(session_id, &subscription_id)
            {
                Ok(()) => {
                    info!(%session_id, subscription = %subscription_id, "unsubscribed");
                    ServerMessage::unsubscribe_ack(true, "unsubscribed")
                }
                Err(e) => ServerMessage::unsubscribe_ack(false, e.to_string()),
            };
            send_json(socket, &response).await
        }
        Ok(ClientMessage::Ping) => send_json(socket, &ServerMessage::Pong).await,
        Err(parse_error) => {
            // A request that at least names its type gets a structured nack.
            let kind = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str().map(String::from)));
            match kind.as_deref() {
                Some("subscribe") => {
                    send_json(
                        socket,
                        &ServerMessage::subscribe_rejected(format!(
                            "malformed subscribe request: {parse_error}"
                        )),
                    )
                    .await
                }
                Some("unsubscribe") => {
                    send_json(
                        socket,
                        &ServerMessage::unsubscribe_ack(
                            false,
                            format!("malformed unsubscribe request: {parse_error}"),
                        ),
                    )
                    .await
                }
                _ => {
                    debug!(%session_id, error = %parse_error, "ignoring unparseable client message");
                    Ok(())
                }
            }
        }
    }
}

async fn handle_subscribe(
    socket: &mut WebSocket,
    state: &AppState,
    session_id: &SessionId,
    request: SubscribeRequest,
) -> Result<(), axum::Error> {
    let subscription = match build_subscription(&request) {
        Ok(subscription) => subscription,
        Err(e) => {
            return send_json(socket, &ServerMessage::subscribe_rejected(e.to_string())).await;
        }
    };

    // Snapshot every requested instrument that exists and passes the
    // predicate. Concurrent ticks may land before or after this read, but
    // each snapshot is internally consistent.
    let mut instruments = Vec::with_capacity(subscription.instrument_ids.len());
    for id in &subscription.instrument_ids {
        if let Some(instrument) = state.store.get(id) {
            let passes = subscription
                .predicate
                .as_ref()
                .map_or(true, |p| p.matches(&instrument.field_map()));
            if passes {
                instruments.push(instrument);
            }
        }
    }

    let subscription_id = Uuid::new_v4().to_string();
    send_json(socket, &ServerMessage::subscribe_ok(subscription_id.clone())).await?;
    send_json(socket, &ServerMessage::InitialData { instruments }).await?;

    match state
        .registry
        .add_subscription(session_id, subscription_id.clone(), subscription)
    {
        Ok(()) => {
            info!(
                %session_id,
                subscription = %subscription_id,
                instruments = request.instrument_ids.len(),
                "subscribed"
            );
        }
        // The session vanished between upgrade and registration.
        Err(e) => warn!(%session_id, error = %e, "subscription registration failed after ack"),
    }
    Ok(())
}

fn build_subscription(request: &SubscribeRequest) -> Result<Subscription, CoreError> {
    let predicate = request
        .filter
        .as_ref()
        .map(Predicate::parse)
        .transpose()
        .map_err(|e| CoreError::invalid(e.to_string()))?;
    Subscription::new(
        request.instrument_ids.clone(),
        predicate,
        request.update_frequency,
    )
}

async fn send_json(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).unwrap_or_else(|e| {
        warn!(error = %e, "failed to serialize server message");
        "{}".to_string()
    });
    socket.send(Message::Text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_subscription_validates_filter_and_ids() {
        let request = SubscribeRequest {
            instrument_ids: vec!["US10Y".into()],
            filter: Some(json!({ "==": [{ "var": "securityType" }, "Bond"] })),
            update_frequency: Some(5.0),
        };
        let subscription = build_subscription(&request).unwrap();
        assert!(subscription.predicate.is_some());
        assert_eq!(subscription.update_frequency, Some(5.0));

        let bad_filter = SubscribeRequest {
            instrument_ids: vec!["US10Y".into()],
            filter: Some(json!({ "~~": [1, 2] })),
            update_frequency: None,
        };
        assert!(build_subscription(&bad_filter).is_err());

        let empty_ids = SubscribeRequest {
            instrument_ids: vec![],
            filter: None,
            update_frequency: None,
        };
        assert!(build_subscription(&empty_ids).is_err());
    }
}
