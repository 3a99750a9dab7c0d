//! Agent Protocol Machine (component G): per-connection WebSocket framing.
//! Grounded in the axum `WebSocketUpgrade -> on_upgrade -> per-connection
//! read loop` shape shown in the OpenIntentOS web crate's `ws.rs`, combined
//! with the teacher's validation/abuse-control idiom.

pub mod abuse;
pub mod frames;

use crate::bus::Event;
use crate::constants::{ABUSE_WINDOW, CONNECTION_OUTBOX_CAPACITY, CONNECTION_READ_TIMEOUT};
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use chrono::Utc;
use frames::{InboundFrame, OutboundFrame};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

pub async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote))
}

#[derive(PartialEq)]
enum ConnState {
    Unidentified,
    Identified,
    Closing,
}

async fn handle_socket(socket: WebSocket, state: AppState, remote: SocketAddr) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(CONNECTION_OUTBOX_CAPACITY);

    let forward = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else { continue };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut conn_state = ConnState::Unidentified;
    let mut agent_id: Option<String> = None;
    let mut identity_key = remote.to_string();
    let mut failure_timestamps: Vec<chrono::DateTime<Utc>> = Vec::new();
    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
    let mut own_kill_tx = Some(kill_tx);

    loop {
        if conn_state == ConnState::Closing {
            break;
        }
        let received = tokio::select! {
            _ = &mut kill_rx => {
                info!(%identity_key, "connection replaced by a newer identify");
                break;
            }
            frame = tokio::time::timeout(CONNECTION_READ_TIMEOUT, stream.next()) => frame,
        };

        let Ok(Some(message)) = received else {
            break;
        };
        let message = match message {
            Ok(m) => m,
            Err(_) => break,
        };

        match message {
            Message::Text(text) => {
                match serde_json::from_str::<InboundFrame>(&text) {
                    Ok(frame) => {
                        handle_frame(
                            frame,
                            &state,
                            &mut conn_state,
                            &mut agent_id,
                            &mut identity_key,
                            &outbound_tx,
                            &mut own_kill_tx,
                        )
                        .await;
                    }
                    Err(err) => {
                        let should_close = record_validation_failure(
                            &state,
                            &identity_key,
                            &mut failure_timestamps,
                            &outbound_tx,
                            format!("malformed frame: {err}"),
                        );
                        if should_close {
                            break;
                        }
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    forward.abort();

    if let Some(agent_id) = agent_id {
        let fsm = state.fsm_registry.get_or_create(&agent_id).await;
        if let Some((task_id, _generation)) = fsm.on_disconnect().await {
            let _ = state.queue.reclaim(&task_id, "agent_offline").await;
        }
        state.presence.unregister(&agent_id).await;
        state.bus.publish(Event::AgentDisconnected { agent_id });
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_frame(
    frame: InboundFrame,
    state: &AppState,
    conn_state: &mut ConnState,
    agent_id: &mut Option<String>,
    identity_key: &mut String,
    outbound_tx: &mpsc::Sender<OutboundFrame>,
    own_kill_tx: &mut Option<oneshot::Sender<()>>,
) {
    if *conn_state == ConnState::Unidentified {
        if let InboundFrame::Identify {
            agent_id: candidate_id,
            token,
            capabilities,
            status,
            ..
        } = frame
        {
            if let Some(remaining) = state.abuse.cooldown_remaining(identity_key) {
                let _ = outbound_tx
                    .send(OutboundFrame::error(
                        "cooldown_active",
                        format!("reconnect cooldown active for {remaining}s"),
                    ))
                    .await;
                *conn_state = ConnState::Closing;
                return;
            }

            match state.auth.verify(&token).await {
                Some(verified_id) if verified_id == candidate_id => {
                    // I6: terminate any existing connection for this agent
                    // before installing ourselves as authoritative.
                    let mut connections = state.connections.lock().await;
                    if let Some(previous) = connections.remove(&candidate_id) {
                        let _ = previous.send(());
                    }
                    if let Some(kill_tx) = own_kill_tx.take() {
                        connections.insert(candidate_id.clone(), kill_tx);
                    }
                    drop(connections);

                    *agent_id = Some(candidate_id.clone());
                    *identity_key = candidate_id.clone();
                    *conn_state = ConnState::Identified;

                    state.presence.register(&candidate_id, capabilities).await;
                    if let Some(status) = status {
                        state.presence.update_status(&candidate_id, &status).await;
                    }
                    let fsm = state.fsm_registry.get_or_create(&candidate_id).await;
                    fsm.on_identify(outbound_tx.clone()).await;
                    state.bus.publish(Event::AgentConnected {
                        agent_id: candidate_id.clone(),
                    });
                    let _ = outbound_tx
                        .send(OutboundFrame::Identified { agent_id: candidate_id })
                        .await;
                }
                _ => {
                    let _ = outbound_tx
                        .send(OutboundFrame::error("unauthorized", "invalid token"))
                        .await;
                }
            }
        } else {
            let _ = outbound_tx
                .send(OutboundFrame::error("not_identified", "send identify first"))
                .await;
        }
        return;
    }

    let Some(agent_id) = agent_id.clone() else { return };
    let fsm = state.fsm_registry.get_or_create(&agent_id).await;

    match frame {
        InboundFrame::Identify { .. } => {
            let _ = outbound_tx
                .send(OutboundFrame::error("already_identified", "connection already identified"))
                .await;
        }
        InboundFrame::Ping => {
            state.presence.touch(&agent_id).await;
            let _ = outbound_tx
                .send(OutboundFrame::Pong { server_time: Utc::now() })
                .await;
        }
        InboundFrame::Status { status } => {
            state.presence.update_status(&agent_id, &status).await;
        }
        InboundFrame::TaskAccepted { task_id } => {
            if let Err(err) = fsm.on_task_accepted(&task_id).await {
                send_error(outbound_tx, &err).await;
            }
        }
        InboundFrame::TaskProgress { task_id, snippet } => {
            let _ = fsm.on_start_work(&task_id).await;
            match state
                .queue
                .get(&task_id)
                .await
                .map(|task| task.generation)
            {
                Ok(generation) => {
                    if let Err(err) = state
                        .queue
                        .update_progress(&task_id, generation, &agent_id, snippet)
                        .await
                    {
                        send_error(outbound_tx, &err).await;
                    }
                }
                Err(err) => send_error(outbound_tx, &err).await,
            }
        }
        InboundFrame::TaskComplete {
            task_id,
            generation,
            result,
            tokens_used,
        } => {
            match state
                .queue
                .complete(&task_id, generation, &agent_id, result, tokens_used)
                .await
            {
                Ok(_) => {
                    let _ = fsm.on_complete(&task_id).await;
                }
                Err(err) => send_error(outbound_tx, &err).await,
            }
        }
        InboundFrame::TaskFailed {
            task_id,
            generation,
            reason,
        } => match state.queue.fail(&task_id, generation, &agent_id, reason).await {
            Ok(_) => {
                let _ = fsm.on_fail(&task_id).await;
            }
            Err(err) => send_error(outbound_tx, &err).await,
        },
        InboundFrame::TaskRecovering { task_id } => {
            let snapshot = fsm.get_state().await;
            let matches_current = snapshot
                .as_ref()
                .map(|s| s.current_task_id.as_deref() == Some(task_id.as_str()))
                .unwrap_or(false);
            if matches_current {
                if let Some(generation) = snapshot.and_then(|s| s.current_task_generation) {
                    let _ = outbound_tx
                        .send(OutboundFrame::TaskContinue { task_id, generation })
                        .await;
                    return;
                }
            }
            let _ = outbound_tx.send(OutboundFrame::TaskReassign { task_id }).await;
        }
        InboundFrame::TaskRejected { task_id, reason } => {
            match state.queue.reclaim(&task_id, &reason).await {
                Ok(_) => {
                    let _ = fsm.on_fail(&task_id).await;
                }
                Err(err) => send_error(outbound_tx, &err).await,
            }
        }
    }
}

async fn send_error(outbound_tx: &mpsc::Sender<OutboundFrame>, err: &crate::error::HubError) {
    let _ = outbound_tx.send(OutboundFrame::error(err.code(), err.to_string())).await;
}

/// Appends a validation-failure timestamp, trims the rolling window, and —
/// if the threshold is crossed — sends an error, arms the escalating
/// cooldown, and returns `true` to tell the caller to close the connection
/// (spec §4.G.4).
fn record_validation_failure(
    state: &AppState,
    identity_key: &str,
    failure_timestamps: &mut Vec<chrono::DateTime<Utc>>,
    outbound_tx: &mpsc::Sender<OutboundFrame>,
    details: String,
) -> bool {
    let _ = outbound_tx.try_send(OutboundFrame::error("validation_failed", details));

    let now = Utc::now();
    failure_timestamps.push(now);
    let abuse_window = chrono::Duration::from_std(ABUSE_WINDOW).unwrap_or(chrono::Duration::zero());
    failure_timestamps.retain(|t| now.signed_duration_since(*t) <= abuse_window);

    if failure_timestamps.len() as u32 >= state.config.validation_failure_threshold {
        warn!(%identity_key, "validation abuse threshold reached, closing connection");
        state.abuse.record_offense(identity_key);
        failure_timestamps.clear();
        true
    } else {
        false
    }
}
