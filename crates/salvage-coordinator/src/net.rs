use crate::registry::{ConnectionHandle, DeviceRegistry};
use crate::scheduler::{DeviceDownReason, Event};
use crate::{CoordinatorConfig, COORDINATOR_SENDER_ID};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use salvage_protocol::{
    Envelope, ErrorData, HeartbeatAckData, NdJsonCodec, Payload, RegisterAckData, StatusReplyData,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub registry: Arc<DeviceRegistry>,
    pub events: mpsc::Sender<Event>,
    pub queue_depth: Arc<AtomicUsize>,
    pub config: Arc<CoordinatorConfig>,
}

pub(crate) async fn run_accept_loop(
    listener: TcpListener,
    ctx: ConnectionContext,
    shutdown: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(ctx.config.max_connections));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(error) => {
                        tracing::warn!(error = %error, "accept failed");
                        continue;
                    }
                };
                let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                    tracing::warn!(%addr, "connection limit reached, refusing worker");
                    continue;
                };
                let ctx = ctx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    handle_connection(stream, addr, ctx, shutdown).await;
                });
            }
        }
    }
}

/// One per accepted socket: sole reader of the stream, with a companion
/// writer task draining the bounded outbox. Must see a valid `register`
/// within the handshake timeout or the socket is closed without a trace in
/// the registry.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: ConnectionContext,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        NdJsonCodec::<Envelope>::with_max_frame_bytes(ctx.config.max_frame_bytes),
    );
    let mut writer = FramedWrite::new(
        write_half,
        NdJsonCodec::<Envelope>::with_max_frame_bytes(ctx.config.max_frame_bytes),
    );

    let handshake = tokio::time::timeout(ctx.config.handshake_timeout, reader.next()).await;
    let envelope = match handshake {
        Ok(Some(Ok(envelope))) => envelope,
        Ok(Some(Err(error))) => {
            tracing::warn!(%addr, error = %error, "malformed frame during handshake");
            let _ = writer
                .send(error_frame("invalid_frame", error.to_string(), None))
                .await;
            return;
        }
        Ok(None) => return,
        Err(_) => {
            tracing::debug!(%addr, "handshake timed out");
            return;
        }
    };

    let Envelope {
        message_id: handshake_message_id,
        payload,
        ..
    } = envelope;
    let info = match payload {
        Payload::Register(info) => info,
        other => {
            tracing::warn!(%addr, message_type = other.message_type(), "handshake did not start with register");
            let _ = writer
                .send(error_frame(
                    "protocol_error",
                    "expected register".to_string(),
                    handshake_message_id,
                ))
                .await;
            return;
        }
    };
    if info.device_id.is_empty() {
        let _ = writer
            .send(Envelope::new(
                COORDINATOR_SENDER_ID,
                Payload::RegisterAck(RegisterAckData {
                    accepted: false,
                    reason: Some("device_id is required".to_string()),
                    assigned_device_id: String::new(),
                }),
            ))
            .await;
        return;
    }

    let device_id = info.device_id.clone();
    let conn_id = Uuid::new_v4();
    let (outbox_tx, outbox_rx) = mpsc::channel(ctx.config.outbox_capacity);
    let conn_token = shutdown.child_token();
    let handle = ConnectionHandle {
        conn_id,
        outbox: outbox_tx.clone(),
        cancel: conn_token.clone(),
    };

    let outcome = ctx.registry.register(&info, addr, handle).await;
    tracing::info!(device_id = %device_id, %addr, was_new = outcome.was_new, "device registered");

    // The ack goes into the outbox before any scheduler event can, so it
    // is always the first frame the worker reads.
    let writer_task = tokio::spawn(write_outbox(writer, outbox_rx, conn_token.clone()));
    let ack = Envelope::new(
        COORDINATOR_SENDER_ID,
        Payload::RegisterAck(RegisterAckData {
            accepted: true,
            reason: None,
            assigned_device_id: device_id.clone(),
        }),
    );
    let _ = outbox_tx.try_send(ack);

    if let Some(replaced) = outcome.replaced {
        tracing::info!(device_id = %device_id, "duplicate registration, evicting prior connection");
        replaced.close();
        if ctx
            .events
            .send(Event::DeviceDown {
                device_id: device_id.clone(),
                reason: DeviceDownReason::Replaced,
            })
            .await
            .is_err()
        {
            conn_token.cancel();
        }
    }

    if ctx
        .events
        .send(Event::DeviceUp {
            device_id: device_id.clone(),
        })
        .await
        .is_err()
    {
        conn_token.cancel();
    }

    loop {
        tokio::select! {
            _ = conn_token.cancelled() => break,
            frame = reader.next() => {
                match frame {
                    Some(Ok(envelope)) => {
                        ctx.registry.touch_seen(&device_id).await;
                        if !route_message(&device_id, envelope, &ctx, &outbox_tx).await {
                            break;
                        }
                    }
                    Some(Err(error)) => {
                        tracing::warn!(device_id = %device_id, error = %error, "malformed frame, closing connection");
                        let _ = outbox_tx.try_send(error_frame(
                            "invalid_frame",
                            error.to_string(),
                            None,
                        ));
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    conn_token.cancel();
    let _ = writer_task.await;
    if ctx.registry.detach(&device_id, conn_id).await {
        tracing::info!(device_id = %device_id, "device disconnected");
        let _ = ctx
            .events
            .send(Event::DeviceDown {
                device_id,
                reason: DeviceDownReason::ConnectionClosed,
            })
            .await;
    }
}

/// Routes a post-registration frame. Returns false when the connection
/// must close (protocol violation or scheduler gone).
async fn route_message(
    device_id: &str,
    envelope: Envelope,
    ctx: &ConnectionContext,
    outbox: &mpsc::Sender<Envelope>,
) -> bool {
    let Envelope {
        message_id,
        payload,
        ..
    } = envelope;
    match payload {
        Payload::Heartbeat(metrics) => {
            if !ctx.registry.record_heartbeat(device_id, &metrics).await {
                tracing::warn!(device_id = %device_id, "heartbeat from unregistered device");
            }
            let ack = Envelope::new(
                COORDINATOR_SENDER_ID,
                Payload::HeartbeatAck(HeartbeatAckData {
                    server_time: Utc::now(),
                    pending_task_hint: ctx.queue_depth.load(Ordering::Relaxed) as u32,
                }),
            );
            let _ = outbox.try_send(ack);
            true
        }
        Payload::TaskResult(data) => ctx
            .events
            .send(Event::Result {
                device_id: device_id.to_string(),
                data,
            })
            .await
            .is_ok(),
        Payload::StatusReply(data) => ctx
            .events
            .send(Event::AssignAck {
                device_id: device_id.to_string(),
                in_reply_to: data.in_reply_to,
            })
            .await
            .is_ok(),
        Payload::StatusQuery(_) => {
            let stats = ctx.registry.stats().await;
            let body = serde_json::json!({
                "devices_online": stats.online,
                "devices_total": stats.total_devices,
                "queued_tasks": ctx.queue_depth.load(Ordering::Relaxed),
            });
            let reply = Envelope::new(
                COORDINATOR_SENDER_ID,
                Payload::StatusReply(StatusReplyData {
                    in_reply_to: message_id.unwrap_or_default(),
                    body,
                }),
            );
            let _ = outbox.try_send(reply);
            true
        }
        Payload::Error(data) => {
            tracing::warn!(
                device_id = %device_id,
                code = %data.code,
                message = %data.message,
                "worker reported error"
            );
            true
        }
        other => {
            tracing::warn!(
                device_id = %device_id,
                message_type = other.message_type(),
                "unexpected message type from worker, closing connection"
            );
            let _ = outbox.try_send(error_frame(
                "protocol_error",
                format!("unexpected message type {}", other.message_type()),
                message_id,
            ));
            false
        }
    }
}

/// Sole writer of the socket. On cancellation, drains whatever is already
/// queued (best-effort error or cancel frames) before dropping the stream.
async fn write_outbox(
    mut writer: FramedWrite<OwnedWriteHalf, NdJsonCodec<Envelope>>,
    mut outbox: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                while let Ok(envelope) = outbox.try_recv() {
                    if writer.send(envelope).await.is_err() {
                        return;
                    }
                }
                return;
            }
            envelope = outbox.recv() => {
                let Some(envelope) = envelope else { return };
                if writer.send(envelope).await.is_err() {
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}

fn error_frame(code: &str, message: String, in_reply_to: Option<String>) -> Envelope {
    Envelope::new(
        COORDINATOR_SENDER_ID,
        Payload::Error(ErrorData {
            code: code.to_string(),
            message,
            in_reply_to,
        }),
    )
}
