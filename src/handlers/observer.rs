#![forbid(unsafe_code)]

// Active-speaker and audio-level observers

use super::{adopt, Session};
use crate::engine::{ActiveSpeakerObserverOptions, AudioLevelObserverOptions, RtpObserver, RtpObserverEvent};
use crate::media::{MediaError, MediaResult, Registry, Router};
use crate::signaling::{DispatchContext, MethodHandler, SocketMessage};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateActiveSpeakerObserverRequest {
    router_id: String,
    #[serde(default = "default_interval")]
    interval: u16,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAudioLevelObserverRequest {
    router_id: String,
    #[serde(default = "default_interval")]
    interval: u16,
    #[serde(default = "default_max_entries")]
    max_entries: u16,
    #[serde(default = "default_threshold")]
    threshold: i8,
}

fn default_interval() -> u16 {
    300
}

fn default_max_entries() -> u16 {
    1
}

fn default_threshold() -> i8 {
    -80
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveSpeakerObserverRef {
    router_id: String,
    active_speaker_observer_id: String,
    #[serde(default)]
    producer_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AudioLevelObserverRef {
    router_id: String,
    audio_level_observer_id: String,
    #[serde(default)]
    producer_id: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Family {
    ActiveSpeaker,
    AudioLevel,
}

impl Family {
    fn registry(self, router: &Router) -> &Registry<dyn RtpObserver> {
        match self {
            Family::ActiveSpeaker => &router.active_speaker_observers,
            Family::AudioLevel => &router.audio_level_observers,
        }
    }
}

/// Observer addressed by a request, plus the producer named alongside it
struct Target {
    router: Arc<Router>,
    observer_id: String,
    producer_id: Option<String>,
}

pub struct ObserverHandler {
    session: Arc<Session>,
}

impl ObserverHandler {
    pub fn new(session: Arc<Session>) -> Self {
        debug!("ObserverHandler created");
        Self { session }
    }

    async fn create_active_speaker_observer(&self, context: &mut DispatchContext) -> MediaResult<()> {
        let request: CreateActiveSpeakerObserverRequest = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;

        let observer = router
            .engine()
            .create_active_speaker_observer(ActiveSpeakerObserverOptions {
                interval: request.interval,
            })
            .await
            .map_err(MediaError::failed("createActiveSpeakerObserver"))?;
        let observer_id = observer.id().to_string();

        let notifier = self.session.notifier.clone();
        let router_id = request.router_id.clone();
        let event_id = observer_id.clone();
        let speakers = observer.on_event(Arc::new(move |event: &RtpObserverEvent| {
            if let RtpObserverEvent::DominantSpeaker { producer_id } = event {
                notifier.notify(SocketMessage::new(
                    "activeSpeakerObserverDominantSpeaker",
                    json!({
                        "routerId": router_id,
                        "activeSpeakerObserverId": event_id,
                        "dominantSpeakerId": producer_id,
                    }),
                ));
            }
        }));

        let notice = self.session.notice(
            "activeSpeakerObserverClosed",
            json!({ "routerId": request.router_id, "activeSpeakerObserverId": observer_id }),
        );
        adopt(&router.active_speaker_observers, observer, notice, vec![speakers])?;

        context.respond("id", observer_id);
        Ok(())
    }

    async fn create_audio_level_observer(&self, context: &mut DispatchContext) -> MediaResult<()> {
        let request: CreateAudioLevelObserverRequest = context.message.parse()?;
        let router = self.session.router(&request.router_id)?;

        let observer = router
            .engine()
            .create_audio_level_observer(AudioLevelObserverOptions {
                interval: request.interval,
                max_entries: request.max_entries,
                threshold: request.threshold,
            })
            .await
            .map_err(MediaError::failed("createAudioLevelObserver"))?;
        let observer_id = observer.id().to_string();

        let notifier = self.session.notifier.clone();
        let router_id = request.router_id.clone();
        let event_id = observer_id.clone();
        let volumes = observer.on_event(Arc::new(move |event: &RtpObserverEvent| {
            if let RtpObserverEvent::Volumes(levels) = event {
                notifier.notify(SocketMessage::new(
                    "audioLevelObserverVolumes",
                    json!({
                        "routerId": router_id,
                        "audioLevelObserverId": event_id,
                        "audioLevels": levels,
                    }),
                ));
            }
        }));

        let notice = self.session.notice(
            "audioLevelObserverClosed",
            json!({ "routerId": request.router_id, "audioLevelObserverId": observer_id }),
        );
        adopt(&router.audio_level_observers, observer, notice, vec![volumes])?;

        context.respond("id", observer_id);
        Ok(())
    }

    fn target(&self, context: &DispatchContext, family: Family) -> MediaResult<Target> {
        let (router_id, observer_id, producer_id) = match family {
            Family::ActiveSpeaker => {
                let r: ActiveSpeakerObserverRef = context.message.parse()?;
                (r.router_id, r.active_speaker_observer_id, r.producer_id)
            }
            Family::AudioLevel => {
                let r: AudioLevelObserverRef = context.message.parse()?;
                (r.router_id, r.audio_level_observer_id, r.producer_id)
            }
        };
        Ok(Target {
            router: self.session.router(&router_id)?,
            observer_id,
            producer_id,
        })
    }

    /// Resolves the observer and checks the named producer is one of this router's
    fn member(&self, context: &DispatchContext, family: Family) -> MediaResult<(Arc<dyn RtpObserver>, String)> {
        let target = self.target(context, family)?;
        let producer_id = target
            .producer_id
            .ok_or_else(|| MediaError::InvalidRequest("missing producerId".to_string()))?;
        let observer = family.registry(&target.router).get(&target.observer_id)?;
        let producer = target.router.producers.get(&producer_id)?;
        Ok((observer, producer.id().to_string()))
    }

    async fn add_producer(&self, context: &DispatchContext, family: Family) -> MediaResult<()> {
        let (observer, producer_id) = self.member(context, family)?;
        observer
            .add_producer(&producer_id)
            .await
            .map_err(MediaError::failed("addProducer"))
    }

    async fn remove_producer(&self, context: &DispatchContext, family: Family) -> MediaResult<()> {
        let (observer, producer_id) = self.member(context, family)?;
        observer
            .remove_producer(&producer_id)
            .await
            .map_err(MediaError::failed("removeProducer"))
    }

    fn close(&self, context: &DispatchContext, family: Family) -> MediaResult<()> {
        let target = self.target(context, family)?;
        family.registry(&target.router).close_by_request(&target.observer_id)
    }
}

#[async_trait]
impl MethodHandler for ObserverHandler {
    async fn handle(&self, context: &mut DispatchContext) -> MediaResult<()> {
        use Family::*;

        match context.method() {
            "createActiveSpeakerObserver" => self.create_active_speaker_observer(context).await?,
            "activeSpeakerObserverAddProducer" => self.add_producer(context, ActiveSpeaker).await?,
            "activeSpeakerObserverRemoveProducer" => self.remove_producer(context, ActiveSpeaker).await?,
            "closeActiveSpeakerObserver" => self.close(context, ActiveSpeaker)?,
            "createAudioLevelObserver" => self.create_audio_level_observer(context).await?,
            "audioLevelObserverAddProducer" => self.add_producer(context, AudioLevel).await?,
            "audioLevelObserverRemoveProducer" => self.remove_producer(context, AudioLevel).await?,
            "closeAudioLevelObserver" => self.close(context, AudioLevel)?,
            _ => return Ok(()),
        }
        context.handled = true;
        Ok(())
    }
}
