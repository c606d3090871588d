#![forbid(unsafe_code)]

// Per-room routing context and the resource maps hanging off it

use crate::engine::{
    Consumer, DataConsumer, DataProducer, EngineRouter, Producer, Resource, RtpObserver, Subscription, Transport,
};
use crate::media::registry::Registry;
use crate::media::types::{MediaError, MediaResult};
use serde_json::Value;
use std::sync::Arc;

const VIDEO_ORIENTATION_URI: &str = "urn:3gpp:video-orientation";

/// A router hosted on one worker for one room. Child registries are shared by every
/// connection that obtained this router.
pub struct Router {
    engine: Arc<dyn EngineRouter>,
    room_id: String,
    worker_pid: u32,
    rtp_capabilities: Value,

    pub webrtc_transports: Registry<dyn Transport>,
    pub pipe_transports: Registry<dyn Transport>,
    pub plain_transports: Registry<dyn Transport>,
    pub producers: Registry<dyn Producer>,
    pub pipe_producers: Registry<dyn Producer>,
    pub consumers: Registry<dyn Consumer>,
    pub pipe_consumers: Registry<dyn Consumer>,
    pub data_producers: Registry<dyn DataProducer>,
    pub pipe_data_producers: Registry<dyn DataProducer>,
    pub data_consumers: Registry<dyn DataConsumer>,
    pub pipe_data_consumers: Registry<dyn DataConsumer>,
    pub active_speaker_observers: Registry<dyn RtpObserver>,
    pub audio_level_observers: Registry<dyn RtpObserver>,
}

impl Router {
    pub fn new(engine: Arc<dyn EngineRouter>, room_id: String, worker_pid: u32) -> Self {
        let rtp_capabilities = advertised_capabilities(engine.rtp_capabilities());

        Self {
            engine,
            room_id,
            worker_pid,
            rtp_capabilities,
            webrtc_transports: Registry::new("transport"),
            pipe_transports: Registry::new("pipeTransport"),
            plain_transports: Registry::new("plainTransport"),
            producers: Registry::new("producer"),
            pipe_producers: Registry::new("pipeProducer"),
            consumers: Registry::new("consumer"),
            pipe_consumers: Registry::new("pipeConsumer"),
            data_producers: Registry::new("dataProducer"),
            pipe_data_producers: Registry::new("pipeDataProducer"),
            data_consumers: Registry::new("dataConsumer"),
            pipe_data_consumers: Registry::new("pipeDataConsumer"),
            active_speaker_observers: Registry::new("activeSpeakerObserver"),
            audio_level_observers: Registry::new("audioLevelObserver"),
        }
    }

    pub fn engine(&self) -> &Arc<dyn EngineRouter> {
        &self.engine
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn worker_pid(&self) -> u32 {
        self.worker_pid
    }

    pub fn rtp_capabilities(&self) -> &Value {
        &self.rtp_capabilities
    }

    pub fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        self.engine.can_consume(producer_id, rtp_capabilities)
    }

    /// Looks in the local producers first, then in the ones piped in from other routers
    pub fn any_producer(&self, producer_id: &str) -> MediaResult<Arc<dyn Producer>> {
        self.producers
            .find(producer_id)
            .or_else(|| self.pipe_producers.find(producer_id))
            .ok_or_else(|| MediaError::not_found("producer", producer_id))
    }

    pub fn any_data_producer(&self, data_producer_id: &str) -> MediaResult<Arc<dyn DataProducer>> {
        self.data_producers
            .find(data_producer_id)
            .or_else(|| self.pipe_data_producers.find(data_producer_id))
            .ok_or_else(|| MediaError::not_found("dataProducer", data_producer_id))
    }
}

impl Resource for Router {
    fn id(&self) -> &str {
        self.engine.id()
    }

    fn closed(&self) -> bool {
        self.engine.closed()
    }

    fn close(&self) {
        self.engine.close();
    }

    fn on_close(&self, callback: Box<dyn FnOnce() + Send>) -> Subscription {
        self.engine.on_close(callback)
    }
}

/// Capabilities offered to peers: the engine's, minus the video-orientation extension
fn advertised_capabilities(mut capabilities: Value) -> Value {
    if let Some(extensions) = capabilities.get_mut("headerExtensions").and_then(Value::as_array_mut) {
        extensions.retain(|ext| ext.get("uri").and_then(Value::as_str) != Some(VIDEO_ORIENTATION_URI));
    }
    capabilities
}
