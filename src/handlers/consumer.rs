#![forbid(unsafe_code)]

// Consumer methods, for WebRTC consumers and consumers feeding a pipe transport

use super::{adopt, Session};
use crate::engine::{Consumer, ConsumerEvent, ConsumerLayers, ConsumerOptions, MediaKind};
use crate::media::{MediaError, MediaResult};
use crate::signaling::{DispatchContext, MethodHandler, Notifier, SocketMessage};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeRequest {
    router_id: String,
    transport_id: String,
    producer_id: String,
    rtp_capabilities: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePipeConsumerRequest {
    router_id: String,
    pipe_transport_id: String,
    producer_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumerRef {
    router_id: String,
    consumer_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipeConsumerRef {
    router_id: String,
    pipe_consumer_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetPreferredLayersRequest {
    router_id: String,
    consumer_id: String,
    #[serde(flatten)]
    layers: ConsumerLayers,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetPriorityRequest {
    router_id: String,
    consumer_id: String,
    priority: u8,
}

/// Forwards a WebRTC consumer's events to the peer
fn forward_consumer_events(notifier: Notifier, router_id: String, consumer_id: String) -> impl Fn(&ConsumerEvent) + Send + Sync + 'static {
    move |event: &ConsumerEvent| {
        let ids = json!({ "routerId": router_id, "consumerId": consumer_id });
        let (method, data) = match event {
            ConsumerEvent::ProducerPause => ("consumerProducerPaused", ids),
            ConsumerEvent::ProducerResume => ("consumerProducerResumed", ids),
            ConsumerEvent::Score(score) => ("consumerScore", with(ids, "score", score.clone())),
            ConsumerEvent::LayersChange(layers) => (
                "consumerLayersChanged",
                with(ids, "layers", serde_json::to_value(layers).unwrap_or(Value::Null)),
            ),
            ConsumerEvent::Pause | ConsumerEvent::Resume => return,
        };
        notifier.notify(SocketMessage::new(method, data));
    }
}

/// Pipe consumers only report whether media is flowing
fn forward_pipe_consumer_events(notifier: Notifier, router_id: String, pipe_consumer_id: String) -> impl Fn(&ConsumerEvent) + Send + Sync + 'static {
    move |event: &ConsumerEvent| {
        let method = match event {
            ConsumerEvent::Pause | ConsumerEvent::ProducerPause => "pipeConsumerPaused",
            ConsumerEvent::Resume | ConsumerEvent::ProducerResume => "pipeConsumerResumed",
            _ => return,
        };
        notifier.notify(SocketMessage::new(
            method,
            json!({ "routerId": router_id, "pipeConsumerId": pipe_consumer_id }),
        ));
    }
}

fn with(mut data: Value, key: &str, value: Value) -> Value {
    if let Value::Object(map) = &mut data {
        map.insert(key.to_string(), value);
    }
    data
}

fn with_all(mut data: Value, extra: &Value) -> Value {
    if let (Value::Object(map), Value::Object(extra)) = (&mut data, extra) {
        map.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    data
}

fn respond_all(context: &mut DispatchContext, fields: Value) {
    if let Value::Object(fields) = fields {
        for (key, value) in fields {
            context.respond(&key, value);
        }
    }
}

pub struct ConsumerHandler {
    session: Arc<Session>,
}

impl ConsumerHandler {
    pub fn new(session: Arc<Session>) -> Self {
        debug!("ConsumerHandler created");
        Self { session }
    }

    fn consumer(&self, context: &DispatchContext) -> MediaResult<Arc<dyn Consumer>> {
        let ConsumerRef { router_id, consumer_id } = context.message.parse()?;
        self.session.router(&router_id)?.consumers.get(&consumer_id)
    }

    async fn consume(&self, context: &mut DispatchContext) -> MediaResult<()> {
        let request: ConsumeRequest = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;
        let transport = router.webrtc_transports.get(&request.transport_id)?;
        let producer = router.any_producer(&request.producer_id)?;

        let consumer = transport
            .consume(ConsumerOptions {
                producer_id: producer.id().to_string(),
                rtp_capabilities: Some(request.rtp_capabilities),
                paused: producer.kind() == MediaKind::Video,
            })
            .await
            .map_err(MediaError::failed("consume"))?;
        let consumer_id = consumer.id().to_string();

        let events = consumer.on_event(Arc::new(forward_consumer_events(
            self.session.notifier.clone(),
            request.router_id.clone(),
            consumer_id.clone(),
        )));
        let notice = self.session.notice(
            "consumerClosed",
            json!({ "routerId": request.router_id, "consumerId": consumer_id }),
        );
        adopt(&router.consumers, consumer.clone(), notice, vec![events])?;

        let description = json!({
            "kind": consumer.kind(),
            "paused": consumer.paused(),
            "producerPaused": consumer.producer_paused(),
            "rtpParameters": consumer.rtp_parameters(),
        });
        self.session.notifier.notify(SocketMessage::new(
            "newConsumer",
            with_all(
                json!({
                    "routerId": request.router_id,
                    "transportId": request.transport_id,
                    "consumerId": consumer_id,
                    "producerId": request.producer_id,
                }),
                &description,
            ),
        ));

        context.respond("id", consumer_id);
        respond_all(context, description);
        Ok(())
    }

    async fn create_pipe_consumer(&self, context: &mut DispatchContext) -> MediaResult<()> {
        let request: CreatePipeConsumerRequest = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;
        let pipe_transport = router.pipe_transports.get(&request.pipe_transport_id)?;
        let producer = router.any_producer(&request.producer_id)?;

        let pipe_consumer = pipe_transport
            .consume(ConsumerOptions {
                producer_id: producer.id().to_string(),
                rtp_capabilities: None,
                paused: false,
            })
            .await
            .map_err(MediaError::failed("createPipeConsumer"))?;
        let pipe_consumer_id = pipe_consumer.id().to_string();

        let events = pipe_consumer.on_event(Arc::new(forward_pipe_consumer_events(
            self.session.notifier.clone(),
            request.router_id.clone(),
            pipe_consumer_id.clone(),
        )));
        let notice = self.session.notice(
            "pipeConsumerClosed",
            json!({ "routerId": request.router_id, "pipeConsumerId": pipe_consumer_id }),
        );
        adopt(&router.pipe_consumers, pipe_consumer.clone(), notice, vec![events])?;

        let description = json!({
            "kind": pipe_consumer.kind(),
            "producerPaused": pipe_consumer.producer_paused(),
            "rtpParameters": pipe_consumer.rtp_parameters(),
        });
        self.session.notifier.notify(SocketMessage::new(
            "newPipeConsumer",
            with_all(
                json!({
                    "routerId": request.router_id,
                    "pipeTransportId": request.pipe_transport_id,
                    "pipeConsumerId": pipe_consumer_id,
                    "producerId": request.producer_id,
                }),
                &description,
            ),
        ));

        context.respond("id", pipe_consumer_id);
        respond_all(context, description);
        Ok(())
    }

    fn close_consumer(&self, context: &DispatchContext) -> MediaResult<()> {
        let ConsumerRef { router_id, consumer_id } = context.message.parse()?;
        self.session.router(&router_id)?.consumers.close_by_request(&consumer_id)
    }

    fn close_pipe_consumer(&self, context: &DispatchContext) -> MediaResult<()> {
        let PipeConsumerRef {
            router_id,
            pipe_consumer_id,
        } = context.message.parse()?;
        self.session.router(&router_id)?.pipe_consumers.close_by_request(&pipe_consumer_id)
    }

    /// Announces `consumerPaused` once the engine has paused the consumer
    async fn pause_consumer(&self, context: &DispatchContext) -> MediaResult<()> {
        let ConsumerRef { router_id, consumer_id } = context.message.parse()?;
        let consumer = self.session.router(&router_id)?.consumers.get(&consumer_id)?;
        consumer.pause().await.map_err(MediaError::failed("pauseConsumer"))?;

        self.session.notifier.notify(SocketMessage::new(
            "consumerPaused",
            json!({ "routerId": router_id, "consumerId": consumer_id }),
        ));
        Ok(())
    }

    async fn resume_consumer(&self, context: &DispatchContext) -> MediaResult<()> {
        let ConsumerRef { router_id, consumer_id } = context.message.parse()?;
        let consumer = self.session.router(&router_id)?.consumers.get(&consumer_id)?;
        consumer.resume().await.map_err(MediaError::failed("resumeConsumer"))?;

        self.session.notifier.notify(SocketMessage::new(
            "consumerResumed",
            json!({ "routerId": router_id, "consumerId": consumer_id }),
        ));
        Ok(())
    }

    async fn set_preferred_layers(&self, context: &DispatchContext) -> MediaResult<()> {
        let request: SetPreferredLayersRequest = context.message.parse()?;
        let consumer = self.session.router(&request.router_id)?.consumers.get(&request.consumer_id)?;
        consumer
            .set_preferred_layers(request.layers)
            .await
            .map_err(MediaError::failed("setConsumerPreferredLayers"))
    }

    async fn set_priority(&self, context: &DispatchContext) -> MediaResult<()> {
        let request: SetPriorityRequest = context.message.parse()?;
        let consumer = self.session.router(&request.router_id)?.consumers.get(&request.consumer_id)?;
        consumer
            .set_priority(request.priority)
            .await
            .map_err(MediaError::failed("setConsumerPriority"))
    }

    async fn request_key_frame(&self, context: &DispatchContext) -> MediaResult<()> {
        let consumer = self.consumer(context)?;
        consumer
            .request_key_frame()
            .await
            .map_err(MediaError::failed("requestConsumerKeyFrame"))
    }
}

#[async_trait]
impl MethodHandler for ConsumerHandler {
    async fn handle(&self, context: &mut DispatchContext) -> MediaResult<()> {
        match context.method() {
            "consume" => self.consume(context).await?,
            "closeConsumer" => self.close_consumer(context)?,
            "pauseConsumer" => self.pause_consumer(context).await?,
            "resumeConsumer" => self.resume_consumer(context).await?,
            "setConsumerPreferredLayers" => self.set_preferred_layers(context).await?,
            "setConsumerPriority" => self.set_priority(context).await?,
            "requestConsumerKeyFrame" => self.request_key_frame(context).await?,
            "createPipeConsumer" => self.create_pipe_consumer(context).await?,
            "closePipeConsumer" => self.close_pipe_consumer(context)?,
            _ => return Ok(()),
        }
        context.handled = true;
        Ok(())
    }
}
