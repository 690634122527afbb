use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::Message;

use super::{EventError, EventSource, RawEvent};

#[derive(Debug, Clone)]
pub struct KafkaParams {
    pub bootstrap_servers: String,
    pub topic: String,
    pub group_id: String,
}

/// Consumer-group subscription to the content event topic.
///
/// Offsets are stored only after an event is acked and committed by the
/// client's auto-commit, giving at-least-once delivery.
pub struct KafkaSource {
    consumer: StreamConsumer,
}

impl KafkaSource {
    pub fn connect(params: &KafkaParams) -> Result<Self, EventError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &params.bootstrap_servers)
            .set("group.id", &params.group_id)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|err| EventError::Transport(format!("kafka client: {}", err)))?;

        consumer
            .subscribe(&[params.topic.as_str()])
            .map_err(|err| EventError::Transport(format!("subscribe {}: {}", params.topic, err)))?;

        log::info!(
            "Subscribed to '{}' on {} as group '{}'",
            params.topic,
            params.bootstrap_servers,
            params.group_id
        );
        Ok(Self { consumer })
    }
}

/// `topic/partition@offset`, the inverse of what `ack` parses.
fn position(topic: &str, partition: i32, offset: i64) -> String {
    format!("{}/{}@{}", topic, partition, offset)
}

fn parse_position(position: &str) -> Option<(&str, i32, i64)> {
    let (rest, offset) = position.rsplit_once('@')?;
    let (topic, partition) = rest.rsplit_once('/')?;
    Some((topic, partition.parse().ok()?, offset.parse().ok()?))
}

#[async_trait]
impl EventSource for KafkaSource {
    async fn next_event(&mut self) -> Result<Option<RawEvent>, EventError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|err| EventError::Transport(err.to_string()))?;

        Ok(Some(RawEvent {
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            position: position(message.topic(), message.partition(), message.offset()),
        }))
    }

    async fn ack(&mut self, event: &RawEvent) -> Result<(), EventError> {
        let (topic, partition, offset) = parse_position(&event.position)
            .ok_or_else(|| EventError::Transport(format!("bad position {}", event.position)))?;
        self.consumer
            .store_offset(topic, partition, offset + 1)
            .map_err(|err| EventError::Transport(err.to_string()))
    }
}
