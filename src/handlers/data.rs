#![forbid(unsafe_code)]

// Data channel methods over SCTP, local and piped

use super::{adopt, Session};
use crate::engine::{DataConsumer, DataConsumerOptions, DataProducerOptions, Resource, Transport};
use crate::media::{MediaError, MediaResult, Registry, Router};
use crate::signaling::{DispatchContext, MethodHandler};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProduceDataRequest {
    router_id: String,
    transport_id: String,
    #[serde(default)]
    sctp_stream_parameters: Option<Value>,
    #[serde(default)]
    label: String,
    #[serde(default)]
    protocol: String,
    #[serde(default)]
    app_data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePipeDataProducerRequest {
    router_id: String,
    pipe_transport_id: String,
    data_producer_id: String,
    #[serde(default)]
    sctp_stream_parameters: Option<Value>,
    #[serde(default)]
    label: String,
    #[serde(default)]
    protocol: String,
    #[serde(default)]
    app_data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeDataRequest {
    router_id: String,
    transport_id: String,
    data_producer_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePipeDataConsumerRequest {
    router_id: String,
    pipe_transport_id: String,
    data_producer_id: String,
}

/// `{routerId, <key>}` naming one resource of the family being closed
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseRequest {
    router_id: String,
    #[serde(flatten)]
    rest: serde_json::Map<String, Value>,
}

impl CloseRequest {
    fn id(&self, key: &str) -> MediaResult<&str> {
        self.rest
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| MediaError::InvalidRequest(format!("missing {key}")))
    }
}

fn respond_with_consumer(context: &mut DispatchContext, consumer: &dyn DataConsumer) {
    context.respond("id", consumer.id());
    context.respond("label", consumer.label());
    context.respond("protocol", consumer.protocol());
    context.respond("sctpStreamParameters", consumer.sctp_stream_parameters().unwrap_or(Value::Null));
}

pub struct DataHandler {
    session: Arc<Session>,
}

impl DataHandler {
    pub fn new(session: Arc<Session>) -> Self {
        debug!("DataHandler created");
        Self { session }
    }

    async fn produce_data(&self, context: &mut DispatchContext) -> MediaResult<()> {
        let request: ProduceDataRequest = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;
        let transport = router.webrtc_transports.get(&request.transport_id)?;

        let data_producer = transport
            .produce_data(DataProducerOptions {
                id: None,
                sctp_stream_parameters: request.sctp_stream_parameters,
                label: request.label,
                protocol: request.protocol,
                app_data: request.app_data,
            })
            .await
            .map_err(MediaError::failed("produceData"))?;
        let data_producer_id = data_producer.id().to_string();

        let notice = self.session.notice(
            "dataProducerClosed",
            json!({ "routerId": request.router_id, "dataProducerId": data_producer_id }),
        );
        adopt(&router.data_producers, data_producer, notice, Vec::new())?;

        context.respond("id", data_producer_id);
        Ok(())
    }

    async fn create_pipe_data_producer(&self, context: &mut DispatchContext) -> MediaResult<()> {
        let request: CreatePipeDataProducerRequest = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;
        let pipe_transport = router.pipe_transports.get(&request.pipe_transport_id)?;

        let pipe_data_producer = pipe_transport
            .produce_data(DataProducerOptions {
                id: Some(request.data_producer_id),
                sctp_stream_parameters: request.sctp_stream_parameters,
                label: request.label,
                protocol: request.protocol,
                app_data: request.app_data,
            })
            .await
            .map_err(MediaError::failed("createPipeDataProducer"))?;
        let pipe_data_producer_id = pipe_data_producer.id().to_string();

        let notice = self.session.notice(
            "pipeDataProducerClosed",
            json!({ "routerId": request.router_id, "pipeDataProducerId": pipe_data_producer_id }),
        );
        adopt(&router.pipe_data_producers, pipe_data_producer, notice, Vec::new())?;

        context.respond("id", pipe_data_producer_id);
        Ok(())
    }

    async fn consume_data(&self, context: &mut DispatchContext) -> MediaResult<()> {
        let request: ConsumeDataRequest = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;
        let transport = router.webrtc_transports.get(&request.transport_id)?;

        let data_consumer = self
            .attach_consumer(&router, transport, &request.data_producer_id, "consumeData")
            .await?;
        let notice = self.session.notice(
            "dataConsumerClosed",
            json!({ "routerId": request.router_id, "dataConsumerId": data_consumer.id() }),
        );
        adopt(&router.data_consumers, data_consumer.clone(), notice, Vec::new())?;

        respond_with_consumer(context, data_consumer.as_ref());
        Ok(())
    }

    async fn create_pipe_data_consumer(&self, context: &mut DispatchContext) -> MediaResult<()> {
        let request: CreatePipeDataConsumerRequest = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;
        let pipe_transport = router.pipe_transports.get(&request.pipe_transport_id)?;

        let pipe_data_consumer = self
            .attach_consumer(&router, pipe_transport, &request.data_producer_id, "createPipeDataConsumer")
            .await?;
        let notice = self.session.notice(
            "pipeDataConsumerClosed",
            json!({ "routerId": request.router_id, "pipeDataConsumerId": pipe_data_consumer.id() }),
        );
        adopt(&router.pipe_data_consumers, pipe_data_consumer.clone(), notice, Vec::new())?;

        respond_with_consumer(context, pipe_data_consumer.as_ref());
        Ok(())
    }

    async fn attach_consumer(
        &self,
        router: &Router,
        transport: Arc<dyn Transport>,
        data_producer_id: &str,
        operation: &'static str,
    ) -> MediaResult<Arc<dyn DataConsumer>> {
        let data_producer = router.any_data_producer(data_producer_id)?;
        transport
            .consume_data(DataConsumerOptions {
                data_producer_id: data_producer.id().to_string(),
            })
            .await
            .map_err(MediaError::failed(operation))
    }

    fn close<T: Resource + ?Sized + 'static>(
        &self,
        context: &DispatchContext,
        key: &str,
        registry: impl Fn(&Router) -> &Registry<T>,
    ) -> MediaResult<()> {
        let request: CloseRequest = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;
        registry(&router).close_by_request(request.id(key)?)
    }
}

#[async_trait]
impl MethodHandler for DataHandler {
    async fn handle(&self, context: &mut DispatchContext) -> MediaResult<()> {
        match context.method() {
            "produceData" => self.produce_data(context).await?,
            "closeDataProducer" => self.close(context, "dataProducerId", |r| &r.data_producers)?,
            "consumeData" => self.consume_data(context).await?,
            "closeDataConsumer" => self.close(context, "dataConsumerId", |r| &r.data_consumers)?,
            "createPipeDataProducer" => self.create_pipe_data_producer(context).await?,
            "closePipeDataProducer" => self.close(context, "pipeDataProducerId", |r| &r.pipe_data_producers)?,
            "createPipeDataConsumer" => self.create_pipe_data_consumer(context).await?,
            "closePipeDataConsumer" => self.close(context, "pipeDataConsumerId", |r| &r.pipe_data_consumers)?,
            _ => return Ok(()),
        }
        context.handled = true;
        Ok(())
    }
}
