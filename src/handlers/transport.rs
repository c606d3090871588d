#![forbid(unsafe_code)]

// Transport methods for WebRTC, pipe and plain transports

use super::{adopt, Session};
use crate::engine::Transport;
use crate::media::{MediaError, MediaResult};
use crate::signaling::{DispatchContext, MethodHandler};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouterRef {
    router_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWebRtcTransportRequest {
    router_id: String,
    #[serde(default)]
    force_tcp: bool,
    #[serde(default)]
    sctp_capabilities: Option<SctpCapabilities>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SctpCapabilities {
    #[serde(default)]
    num_streams: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebRtcTransportRef {
    router_id: String,
    transport_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectWebRtcTransportRequest {
    router_id: String,
    transport_id: String,
    dtls_parameters: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetMaxIncomingBitrateRequest {
    router_id: String,
    transport_id: String,
    bitrate: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipeTransportRef {
    router_id: String,
    pipe_transport_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlainTransportRef {
    router_id: String,
    plain_transport_id: String,
}

/// Copies the named transport parameters into the response
fn respond_with(context: &mut DispatchContext, transport: &dyn Transport, keys: &[&str]) {
    context.respond("id", transport.id());
    let parameters = transport.parameters();
    for key in keys {
        context.respond(key, parameters.get(*key).cloned().unwrap_or(Value::Null));
    }
}

/// Everything except the addressing fields, handed to `connect` as is
fn connect_parameters(data: &Value, skip: &[&str]) -> Value {
    let parameters: Map<String, Value> = data
        .as_object()
        .map(|data| {
            data.iter()
                .filter(|(key, _)| !skip.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        })
        .unwrap_or_default();
    Value::Object(parameters)
}

pub struct TransportHandler {
    session: Arc<Session>,
}

impl TransportHandler {
    pub fn new(session: Arc<Session>) -> Self {
        debug!("TransportHandler created");
        Self { session }
    }

    async fn create_webrtc_transport(&self, context: &mut DispatchContext) -> MediaResult<()> {
        let request: CreateWebRtcTransportRequest = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;

        let config = &self.session.workers.config().webrtc_transport_config;
        let num_sctp_streams = request.sctp_capabilities.map(|caps| caps.num_streams);
        let options = config.to_transport_options(request.force_tcp, num_sctp_streams);

        let transport = router
            .engine()
            .create_webrtc_transport(options)
            .await
            .map_err(MediaError::failed("createWebRtcTransport"))?;

        let notice = self.session.notice(
            "webRtcTransportClosed",
            json!({ "routerId": request.router_id, "transportId": transport.id() }),
        );
        adopt(&router.webrtc_transports, transport.clone(), notice, Vec::new())?;

        respond_with(
            context,
            transport.as_ref(),
            &["iceParameters", "iceCandidates", "dtlsParameters", "sctpParameters"],
        );

        if let Some(bitrate) = config.max_incoming_bitrate {
            tokio::spawn(async move {
                if let Err(e) = transport.set_max_incoming_bitrate(bitrate).await {
                    debug!("Ignoring maxIncomingBitrate failure on {}: {}", transport.id(), e);
                }
            });
        }
        Ok(())
    }

    async fn connect_webrtc_transport(&self, context: &DispatchContext) -> MediaResult<()> {
        let request: ConnectWebRtcTransportRequest = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;
        let transport = router.webrtc_transports.get(&request.transport_id)?;

        transport
            .connect(json!({ "dtlsParameters": request.dtls_parameters }))
            .await
            .map_err(MediaError::failed("connectWebRtcTransport"))
    }

    fn close_webrtc_transport(&self, context: &DispatchContext) -> MediaResult<()> {
        let request: WebRtcTransportRef = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;
        router.webrtc_transports.close_by_request(&request.transport_id)
    }

    async fn restart_ice(&self, context: &mut DispatchContext) -> MediaResult<()> {
        let request: WebRtcTransportRef = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;
        let transport = router.webrtc_transports.get(&request.transport_id)?;

        let ice_parameters = transport.restart_ice().await.map_err(MediaError::failed("restartIce"))?;
        context.respond("iceParameters", ice_parameters);
        Ok(())
    }

    async fn set_max_incoming_bitrate(&self, context: &DispatchContext) -> MediaResult<()> {
        let request: SetMaxIncomingBitrateRequest = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;
        let transport = router.webrtc_transports.get(&request.transport_id)?;

        transport
            .set_max_incoming_bitrate(request.bitrate)
            .await
            .map_err(MediaError::failed("setMaxIncomingBitrate"))
    }

    async fn create_pipe_transport(&self, context: &mut DispatchContext) -> MediaResult<()> {
        let RouterRef { router_id } = context.message.parse()?;
        let router = self.session.router(&router_id)?;

        let options = self.session.workers.config().worker_config.to_pipe_transport_options();
        let transport = router
            .engine()
            .create_pipe_transport(options)
            .await
            .map_err(MediaError::failed("createPipeTransport"))?;

        let notice = self.session.notice(
            "pipeTransportClosed",
            json!({ "routerId": router_id, "pipeTransportId": transport.id() }),
        );
        adopt(&router.pipe_transports, transport.clone(), notice, Vec::new())?;

        respond_with(context, transport.as_ref(), &["ip", "port", "srtpParameters"]);
        Ok(())
    }

    async fn connect_pipe_transport(&self, context: &DispatchContext) -> MediaResult<()> {
        let request: PipeTransportRef = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;
        let transport = router.pipe_transports.get(&request.pipe_transport_id)?;

        let parameters = connect_parameters(&context.message.data, &["routerId", "pipeTransportId"]);
        transport
            .connect(parameters)
            .await
            .map_err(MediaError::failed("connectPipeTransport"))
    }

    fn close_pipe_transport(&self, context: &DispatchContext) -> MediaResult<()> {
        let request: PipeTransportRef = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;
        router.pipe_transports.close_by_request(&request.pipe_transport_id)
    }

    async fn create_plain_transport(&self, context: &mut DispatchContext) -> MediaResult<()> {
        let RouterRef { router_id } = context.message.parse()?;
        let router = self.session.router(&router_id)?;

        let options = self.session.workers.config().worker_config.to_plain_transport_options();
        let transport = router
            .engine()
            .create_plain_transport(options)
            .await
            .map_err(MediaError::failed("createPlainTransport"))?;

        let notice = self.session.notice(
            "plainTransportClosed",
            json!({ "routerId": router_id, "plainTransportId": transport.id() }),
        );
        adopt(&router.plain_transports, transport.clone(), notice, Vec::new())?;

        respond_with(context, transport.as_ref(), &["ip", "port", "rtcpPort", "srtpParameters"]);
        Ok(())
    }

    async fn connect_plain_transport(&self, context: &DispatchContext) -> MediaResult<()> {
        let request: PlainTransportRef = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;
        let transport = router.plain_transports.get(&request.plain_transport_id)?;

        let parameters = connect_parameters(&context.message.data, &["routerId", "plainTransportId"]);
        transport
            .connect(parameters)
            .await
            .map_err(MediaError::failed("connectPlainTransport"))
    }

    fn close_plain_transport(&self, context: &DispatchContext) -> MediaResult<()> {
        let request: PlainTransportRef = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;
        router.plain_transports.close_by_request(&request.plain_transport_id)
    }
}

#[async_trait]
impl MethodHandler for TransportHandler {
    async fn handle(&self, context: &mut DispatchContext) -> MediaResult<()> {
        match context.method() {
            "createWebRtcTransport" => self.create_webrtc_transport(context).await?,
            "connectWebRtcTransport" => self.connect_webrtc_transport(context).await?,
            "closeWebRtcTransport" => self.close_webrtc_transport(context)?,
            "restartIce" => self.restart_ice(context).await?,
            "setMaxIncomingBitrate" => self.set_max_incoming_bitrate(context).await?,
            "createPipeTransport" => self.create_pipe_transport(context).await?,
            "connectPipeTransport" => self.connect_pipe_transport(context).await?,
            "closePipeTransport" => self.close_pipe_transport(context)?,
            "createPlainTransport" => self.create_plain_transport(context).await?,
            "connectPlainTransport" => self.connect_plain_transport(context).await?,
            "closePlainTransport" => self.close_plain_transport(context)?,
            _ => return Ok(()),
        }
        context.handled = true;
        Ok(())
    }
}
