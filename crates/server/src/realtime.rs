use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use client_core::{LocalBus, LocalHub, RealtimeBus};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
    protocol::{BusClientFrame, BusServerFrame, Topic},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

type Outgoing = mpsc::UnboundedSender<BusServerFrame>;

/// One websocket client on the topic hub. Presence it tracked is withdrawn
/// when the socket closes.
pub(crate) async fn ws_connection(hub: Arc<LocalHub>, socket: WebSocket, user_id: UserId) {
    let (mut sender, mut receiver) = socket.split();
    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<BusServerFrame>();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outgoing_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    info!(user_id = user_id.0, "ws: connected");
    let mut connection = Connection {
        bus: hub.connect(),
        user_id,
        outgoing,
        forwarders: HashMap::new(),
    };

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let frame = match serde_json::from_str::<BusClientFrame>(&text) {
            Ok(frame) => frame,
            Err(err) => {
                connection.report(ErrorCode::Validation, format!("invalid frame: {err}"));
                continue;
            }
        };
        if let Err(err) = connection.handle(frame).await {
            warn!(user_id = user_id.0, "ws: frame failed: {err}");
            connection.report(ErrorCode::Internal, err.to_string());
        }
    }

    connection.close();
    send_task.abort();
    info!(user_id = user_id.0, "ws: disconnected");
}

struct Connection {
    bus: LocalBus,
    user_id: UserId,
    outgoing: Outgoing,
    forwarders: HashMap<Topic, JoinHandle<()>>,
}

impl Connection {
    async fn handle(&mut self, frame: BusClientFrame) -> Result<()> {
        match frame {
            BusClientFrame::Subscribe { topic } => self.subscribe(topic).await,
            BusClientFrame::Unsubscribe { topic } => {
                self.bus.unsubscribe(topic).await?;
                if let Some(task) = self.forwarders.remove(&topic) {
                    task.abort();
                }
                Ok(())
            }
            BusClientFrame::Track { topic, entry } => {
                if entry.user_id != self.user_id {
                    self.report(
                        ErrorCode::Forbidden,
                        "presence can only be tracked for the connected user",
                    );
                    return Ok(());
                }
                self.bus.publish_presence(topic, entry).await
            }
            BusClientFrame::Untrack { topic } => self.bus.withdraw_presence(topic).await,
        }
    }

    async fn subscribe(&mut self, topic: Topic) -> Result<()> {
        if self.forwarders.contains_key(&topic) {
            return Ok(());
        }
        let outgoing = self.outgoing.clone();
        let task = match topic {
            Topic::Messages(_) => {
                let mut changes = self.bus.subscribe_data(topic).await?;
                tokio::spawn(async move {
                    while let Some(change) = changes.next().await {
                        if outgoing.send(BusServerFrame::Data { topic, change }).is_err() {
                            break;
                        }
                    }
                })
            }
            Topic::Typing(_) => {
                let mut events = self.bus.subscribe_presence(topic).await?;
                tokio::spawn(async move {
                    while let Some(event) = events.next().await {
                        if outgoing.send(BusServerFrame::Presence { topic, event }).is_err() {
                            break;
                        }
                    }
                })
            }
        };
        debug!(user_id = self.user_id.0, %topic, "ws: subscribed");
        self.forwarders.insert(topic, task);
        Ok(())
    }

    fn report(&self, code: ErrorCode, message: impl Into<String>) {
        let _ = self
            .outgoing
            .send(BusServerFrame::Error(ApiError::new(code, message)));
    }

    fn close(self) {
        for (_, task) in self.forwarders {
            task.abort();
        }
        // Dropping the bus withdraws this connection's presence.
        drop(self.bus);
    }
}
