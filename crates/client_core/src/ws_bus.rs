use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{TypingPresenceEntry, UserId},
    protocol::{BusClientFrame, BusServerFrame, DataChange, PresenceEvent, Topic},
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::bus::{lossy_stream, DataStream, Holders, PresenceStream, RealtimeBus};

const TOPIC_CHANNEL_CAPACITY: usize = 256;

struct TopicSenders {
    data: broadcast::Sender<DataChange>,
    presence: broadcast::Sender<PresenceEvent>,
    holders: usize,
}

type TopicTable = Arc<Mutex<HashMap<Topic, TopicSenders>>>;

/// Realtime bus backed by the server's `/ws` hub.
pub struct WsBus {
    outgoing: mpsc::UnboundedSender<BusClientFrame>,
    topics: TopicTable,
    presence: Mutex<Holders>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub fn websocket_url(server_url: &str, user_id: UserId) -> Result<String> {
    let mut url =
        Url::parse(server_url).with_context(|| format!("invalid server_url: {server_url}"))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        _ => return Err(anyhow!("server_url must start with http:// or https://")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot use {scheme} for {server_url}"))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    url.query_pairs_mut()
        .append_pair("user_id", &user_id.0.to_string());
    Ok(url.into())
}

impl WsBus {
    pub async fn connect(server_url: &str, user_id: UserId) -> Result<Self> {
        let ws_url = websocket_url(server_url, user_id)?;
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        info!(url = %ws_url, "bus: websocket connected");

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<BusClientFrame>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("bus: failed to encode client frame: {err}");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!("bus: websocket send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let topics: TopicTable = Arc::new(Mutex::new(HashMap::new()));
        let reader_topics = Arc::clone(&topics);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<BusServerFrame>(&text) {
                        Ok(frame) => dispatch(&reader_topics, frame),
                        Err(err) => warn!("bus: invalid server frame: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("bus: websocket receive failed: {err}");
                        break;
                    }
                }
            }
            // Dropping the senders ends every open stream.
            if let Ok(mut topics) = reader_topics.lock() {
                topics.clear();
            }
            debug!("bus: websocket reader finished");
        });

        Ok(Self {
            outgoing,
            topics,
            presence: Mutex::new(Holders::default()),
            reader,
            writer,
        })
    }

    fn send_frame(&self, frame: BusClientFrame) -> Result<()> {
        self.outgoing
            .send(frame)
            .map_err(|_| anyhow!("websocket connection is closed"))
    }

    /// Returns receivers for `topic`, registering it with the server for the
    /// first holder. Receivers exist before the subscribe frame is sent so
    /// nothing the server answers with is missed.
    fn ensure_topic(
        &self,
        topic: Topic,
    ) -> Result<(
        broadcast::Receiver<DataChange>,
        broadcast::Receiver<PresenceEvent>,
    )> {
        let (receivers, is_new) = {
            let mut topics = self
                .topics
                .lock()
                .map_err(|_| anyhow!("bus topic table poisoned"))?;
            let is_new = !topics.contains_key(&topic);
            let senders = topics.entry(topic).or_insert_with(|| TopicSenders {
                data: broadcast::channel(TOPIC_CHANNEL_CAPACITY).0,
                presence: broadcast::channel(TOPIC_CHANNEL_CAPACITY).0,
                holders: 0,
            });
            senders.holders += 1;
            (
                (senders.data.subscribe(), senders.presence.subscribe()),
                is_new,
            )
        };
        if is_new {
            self.send_frame(BusClientFrame::Subscribe { topic })?;
        }
        Ok(receivers)
    }
}

fn dispatch(topics: &TopicTable, frame: BusServerFrame) {
    let Ok(topics) = topics.lock() else {
        return;
    };
    match frame {
        BusServerFrame::Data { topic, change } => {
            if let Some(senders) = topics.get(&topic) {
                let _ = senders.data.send(change);
            }
        }
        BusServerFrame::Presence { topic, event } => {
            if let Some(senders) = topics.get(&topic) {
                let _ = senders.presence.send(event);
            }
        }
        BusServerFrame::Error(err) => {
            warn!(code = ?err.code, "bus: server reported error: {}", err.message);
        }
    }
}

#[async_trait]
impl RealtimeBus for WsBus {
    async fn subscribe_data(&self, topic: Topic) -> Result<DataStream> {
        let (data, _) = self.ensure_topic(topic)?;
        Ok(lossy_stream(topic, data))
    }

    async fn subscribe_presence(&self, topic: Topic) -> Result<PresenceStream> {
        let (_, presence) = self.ensure_topic(topic)?;
        Ok(lossy_stream(topic, presence))
    }

    async fn unsubscribe(&self, topic: Topic) -> Result<()> {
        let last = {
            let mut topics = self
                .topics
                .lock()
                .map_err(|_| anyhow!("bus topic table poisoned"))?;
            match topics.get_mut(&topic) {
                Some(senders) if senders.holders > 1 => {
                    senders.holders -= 1;
                    false
                }
                Some(_) => topics.remove(&topic).is_some(),
                None => false,
            }
        };
        if last {
            self.send_frame(BusClientFrame::Unsubscribe { topic })?;
        }
        Ok(())
    }

    /// Only the first holder's entry reaches the server.
    async fn publish_presence(&self, topic: Topic, entry: TypingPresenceEntry) -> Result<()> {
        let first = self
            .presence
            .lock()
            .map_err(|_| anyhow!("bus presence poisoned"))?
            .acquire(topic);
        if !first {
            return Ok(());
        }
        let sent = self.send_frame(BusClientFrame::Track { topic, entry });
        if sent.is_err() {
            if let Ok(mut presence) = self.presence.lock() {
                presence.release(topic);
            }
        }
        sent
    }

    async fn withdraw_presence(&self, topic: Topic) -> Result<()> {
        let last = self
            .presence
            .lock()
            .map_err(|_| anyhow!("bus presence poisoned"))?
            .release(topic);
        if last {
            self.send_frame(BusClientFrame::Untrack { topic })?;
        }
        Ok(())
    }
}

impl Drop for WsBus {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_follows_the_http_scheme() {
        assert_eq!(
            websocket_url("http://127.0.0.1:8443", UserId(4)).expect("url"),
            "ws://127.0.0.1:8443/ws?user_id=4"
        );
        assert_eq!(
            websocket_url("https://chat.example.com/", UserId(4)).expect("url"),
            "wss://chat.example.com/ws?user_id=4"
        );
        assert!(websocket_url("ftp://example.com", UserId(4)).is_err());
    }
}
