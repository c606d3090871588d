#![forbid(unsafe_code)]

// Router methods: placement, explicit close and consumability checks

use super::Session;
use crate::engine::Resource;
use crate::media::MediaResult;
use crate::signaling::{DispatchContext, MethodHandler};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetRouterRequest {
    room_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouterRef {
    router_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CanConsumeRequest {
    router_id: String,
    producer_id: String,
    rtp_capabilities: Value,
}

pub struct RouterHandler {
    session: Arc<Session>,
}

impl RouterHandler {
    pub fn new(session: Arc<Session>) -> Self {
        debug!("RouterHandler created");
        Self { session }
    }

    async fn get_router(&self, context: &mut DispatchContext) -> MediaResult<()> {
        let GetRouterRequest { room_id } = context.message.parse()?;
        let router = self.session.workers.get_router(&room_id).await?;
        let router_id = router.id().to_string();

        // The same router comes back for every participant placed on it
        if !self.session.routers.contains(&router_id) {
            let notice = self.session.notice("routerClosed", json!({ "routerId": router_id }));
            self.session.routers.register(router.clone(), notice, Vec::new());
        }

        context.respond("id", router_id);
        context.respond("rtpCapabilities", router.rtp_capabilities().clone());
        Ok(())
    }

    fn close_router(&self, context: &DispatchContext) -> MediaResult<()> {
        let RouterRef { router_id } = context.message.parse()?;
        self.session.routers.close_by_request(&router_id)
    }

    fn can_consume(&self, context: &mut DispatchContext) -> MediaResult<()> {
        let request: CanConsumeRequest = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;

        let can_consume = router.can_consume(&request.producer_id, &request.rtp_capabilities);
        context.respond("canConsume", can_consume);
        Ok(())
    }
}

#[async_trait]
impl MethodHandler for RouterHandler {
    async fn handle(&self, context: &mut DispatchContext) -> MediaResult<()> {
        match context.method() {
            "getRouter" => self.get_router(context).await?,
            "closeRouter" => self.close_router(context)?,
            "canConsume" => self.can_consume(context)?,
            _ => return Ok(()),
        }
        context.handled = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixture::Fixture;
    use crate::engine::Resource;
    use crate::media::MediaError;
    use serde_json::json;

    #[tokio::test]
    async fn get_router_registers_once_and_advertises_capabilities() {
        let f = Fixture::new().await;

        let first = f.ok("getRouter", json!({ "roomId": "room" })).await;
        let second = f.ok("getRouter", json!({ "roomId": "room" })).await;

        assert_eq!(first["id"], second["id"]);
        assert_eq!(f.session.routers.len(), 1);
        let extensions = first["rtpCapabilities"]["headerExtensions"].as_array().unwrap();
        assert!(extensions.iter().all(|e| e["uri"] != "urn:3gpp:video-orientation"));
    }

    #[tokio::test]
    async fn spontaneous_router_close_is_reported() {
        let f = Fixture::new().await;
        let router_id = f.router().await;

        f.session.router(&router_id).unwrap().close();

        assert!(f.session.routers.is_empty());
        let closed = f.peer.notifications_named("routerClosed");
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0]["routerId"], router_id.as_str());
    }

    #[tokio::test]
    async fn close_router_by_request_is_silent() {
        let f = Fixture::new().await;
        let router_id = f.router().await;

        f.ok("closeRouter", json!({ "routerId": router_id })).await;

        assert!(f.session.routers.is_empty());
        assert!(f.peer.notifications_named("routerClosed").is_empty());
        assert_eq!(f.workers.metrics().values().next().unwrap().routers, 0);
    }

    #[tokio::test]
    async fn unknown_router_fails() {
        let f = Fixture::new().await;

        let err = f.call("closeRouter", json!({ "routerId": "nope" })).await.unwrap_err();
        assert!(matches!(err, MediaError::NotFound { kind: "router", .. }));
    }

    #[tokio::test]
    async fn can_consume_reflects_capabilities() {
        let f = Fixture::new().await;
        let router_id = f.router().await;
        let transport_id = f.webrtc_transport(&router_id).await;
        let producer_id = f.produce(&router_id, &transport_id, "video").await;

        let yes = f
            .ok(
                "canConsume",
                json!({ "routerId": router_id, "producerId": producer_id, "rtpCapabilities": Fixture::caps() }),
            )
            .await;
        let no = f
            .ok(
                "canConsume",
                json!({ "routerId": router_id, "producerId": producer_id, "rtpCapabilities": { "codecs": [] } }),
            )
            .await;

        assert_eq!(yes["canConsume"], true);
        assert_eq!(no["canConsume"], false);
    }
}
