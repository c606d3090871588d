#![forbid(unsafe_code)]

// Producer methods, including producers piped in from another router

use super::{adopt, Session};
use crate::engine::{MediaKind, Producer, ProducerEvent, ProducerOptions};
use crate::media::{MediaError, MediaResult, Registry, Router};
use crate::signaling::{DispatchContext, MethodHandler, SocketMessage};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProduceRequest {
    router_id: String,
    transport_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    #[serde(default)]
    paused: bool,
    #[serde(default)]
    app_data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePipeProducerRequest {
    router_id: String,
    pipe_transport_id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    #[serde(default)]
    paused: bool,
    #[serde(default)]
    app_data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProducerRef {
    router_id: String,
    producer_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipeProducerRef {
    router_id: String,
    pipe_producer_id: String,
}

pub struct ProducerHandler {
    session: Arc<Session>,
}

impl ProducerHandler {
    pub fn new(session: Arc<Session>) -> Self {
        debug!("ProducerHandler created");
        Self { session }
    }

    async fn produce(&self, context: &mut DispatchContext) -> MediaResult<()> {
        let request: ProduceRequest = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;
        let transport = router.webrtc_transports.get(&request.transport_id)?;

        let producer = transport
            .produce(ProducerOptions {
                id: None,
                kind: request.kind,
                rtp_parameters: request.rtp_parameters,
                paused: request.paused,
                app_data: request.app_data,
            })
            .await
            .map_err(MediaError::failed("produce"))?;
        let producer_id = producer.id().to_string();

        let notifier = self.session.notifier.clone();
        let router_id = request.router_id.clone();
        let score_id = producer_id.clone();
        let scores = producer.on_event(Arc::new(move |event: &ProducerEvent| match event {
            ProducerEvent::Score(score) => notifier.notify(SocketMessage::new(
                "producerScore",
                json!({ "routerId": router_id, "producerId": score_id, "score": score }),
            )),
        }));

        let notice = self.session.notice(
            "producerClosed",
            json!({ "routerId": request.router_id, "producerId": producer_id }),
        );
        adopt(&router.producers, producer, notice, vec![scores])?;

        context.respond("id", producer_id);
        Ok(())
    }

    async fn create_pipe_producer(&self, context: &mut DispatchContext) -> MediaResult<()> {
        let request: CreatePipeProducerRequest = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;
        let pipe_transport = router.pipe_transports.get(&request.pipe_transport_id)?;

        let pipe_producer = pipe_transport
            .produce(ProducerOptions {
                id: Some(request.producer_id),
                kind: request.kind,
                rtp_parameters: request.rtp_parameters,
                paused: request.paused,
                app_data: request.app_data,
            })
            .await
            .map_err(MediaError::failed("createPipeProducer"))?;
        let pipe_producer_id = pipe_producer.id().to_string();

        let notice = self.session.notice(
            "pipeProducerClosed",
            json!({ "routerId": request.router_id, "pipeProducerId": pipe_producer_id }),
        );
        adopt(&router.pipe_producers, pipe_producer, notice, Vec::new())?;

        context.respond("id", pipe_producer_id);
        Ok(())
    }

    fn target(&self, context: &DispatchContext, pipe: bool) -> MediaResult<(Arc<Router>, String)> {
        let (router_id, id) = if pipe {
            let PipeProducerRef {
                router_id,
                pipe_producer_id,
            } = context.message.parse()?;
            (router_id, pipe_producer_id)
        } else {
            let ProducerRef { router_id, producer_id } = context.message.parse()?;
            (router_id, producer_id)
        };
        Ok((self.session.router(&router_id)?, id))
    }

    fn close(&self, context: &DispatchContext, pipe: bool) -> MediaResult<()> {
        let (router, id) = self.target(context, pipe)?;
        registry(&router, pipe).close_by_request(&id)
    }

    async fn pause(&self, context: &DispatchContext, pipe: bool) -> MediaResult<()> {
        let (router, id) = self.target(context, pipe)?;
        let producer = registry(&router, pipe).get(&id)?;
        producer.pause().await.map_err(MediaError::failed("pauseProducer"))
    }

    async fn resume(&self, context: &DispatchContext, pipe: bool) -> MediaResult<()> {
        let (router, id) = self.target(context, pipe)?;
        let producer = registry(&router, pipe).get(&id)?;
        producer.resume().await.map_err(MediaError::failed("resumeProducer"))
    }
}

fn registry(router: &Router, pipe: bool) -> &Registry<dyn Producer> {
    if pipe {
        &router.pipe_producers
    } else {
        &router.producers
    }
}

#[async_trait]
impl MethodHandler for ProducerHandler {
    async fn handle(&self, context: &mut DispatchContext) -> MediaResult<()> {
        match context.method() {
            "produce" => self.produce(context).await?,
            "closeProducer" => self.close(context, false)?,
            "pauseProducer" => self.pause(context, false).await?,
            "resumeProducer" => self.resume(context, false).await?,
            "createPipeProducer" => self.create_pipe_producer(context).await?,
            "closePipeProducer" => self.close(context, true)?,
            "pausePipeProducer" => self.pause(context, true).await?,
            "resumePipeProducer" => self.resume(context, true).await?,
            _ => return Ok(()),
        }
        context.handled = true;
        Ok(())
    }
}
