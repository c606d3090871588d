#![forbid(unsafe_code)]

// WebSocket peer: JSON envelopes over a socket, with request/response correlation

use super::connection::SERVER_ERROR;
use super::protocol::{ConnectionError, Envelope, InboundMessage, PeerConnection, SocketMessage};
use async_trait::async_trait;
use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Outbound frames buffered per peer before `notify` starts failing
const CHANNEL_CAPACITY: usize = 256;

/// Inbound messages buffered before the socket reader waits for the connection
const INBOUND_CAPACITY: usize = 256;

/// How long an outbound request waits for its response
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

enum Outbound {
    Text(Arc<String>),
    Close,
}

type PendingRequests = Mutex<HashMap<u64, oneshot::Sender<Result<Value, ConnectionError>>>>;

pub struct WebSocketPeer {
    outbound: mpsc::Sender<Outbound>,
    pending: PendingRequests,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl WebSocketPeer {
    /// Starts the send and receive tasks for a split socket. The receiver yields every
    /// inbound request and notification, then `Closed` once the socket ends.
    pub fn attach<Si, St, E>(mut sink: Si, mut stream: St) -> (Arc<Self>, mpsc::Receiver<InboundMessage>)
    where
        Si: Sink<Message> + Unpin + Send + 'static,
        St: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Outbound>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let peer = Arc::new(Self {
            outbound: tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        // Spawn task to send messages to the peer
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    Outbound::Text(json) => {
                        if sink.send(Message::Text((*json).clone().into())).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            debug!("WebSocket send task finished");
        });

        let reader = peer.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("WebSocket receive error: {}", e);
                        break;
                    }
                };

                match serde_json::from_str::<Envelope>(text.as_str()) {
                    Ok(envelope) => {
                        if !reader.dispatch(envelope, &inbound_tx).await {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping malformed frame: {}", e),
                }
            }

            reader.mark_closed();
            let _ = inbound_tx.send(InboundMessage::Closed).await;
        });

        (peer, inbound_rx)
    }

    /// Returns false once the owner stopped listening
    async fn dispatch(self: &Arc<Self>, envelope: Envelope, inbound: &mpsc::Sender<InboundMessage>) -> bool {
        match envelope {
            Envelope::Request { id, method, data } => {
                let (responder, response) = oneshot::channel();
                let message = SocketMessage::new(method, data);
                if inbound.send(InboundMessage::Request { message, responder }).await.is_err() {
                    return false;
                }

                let peer = self.clone();
                tokio::spawn(async move {
                    let envelope = match response.await {
                        Ok(Ok(data)) => Envelope::Response {
                            id,
                            ok: true,
                            data: Some(Value::Object(data)),
                            error_reason: None,
                        },
                        Ok(Err(reason)) => Envelope::Response {
                            id,
                            ok: false,
                            data: None,
                            error_reason: Some(reason),
                        },
                        Err(_) => Envelope::Response {
                            id,
                            ok: false,
                            data: None,
                            error_reason: Some(SERVER_ERROR.to_string()),
                        },
                    };
                    if let Err(e) = peer.send(&envelope) {
                        debug!("Response {} not delivered: {}", id, e);
                    }
                });
                true
            }
            Envelope::Response {
                id,
                ok,
                data,
                error_reason,
            } => {
                let waiter = self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                match waiter {
                    Some(waiter) => {
                        let result = if ok {
                            Ok(data.unwrap_or(Value::Null))
                        } else {
                            Err(ConnectionError::Rejected(error_reason.unwrap_or_default()))
                        };
                        let _ = waiter.send(result);
                    }
                    None => debug!("Response for unknown request {}", id),
                }
                true
            }
            Envelope::Notification { method, data } => inbound
                .send(InboundMessage::Notification(SocketMessage::new(method, data)))
                .await
                .is_ok(),
        }
    }

    fn send(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        let json = Arc::new(serde_json::to_string(envelope)?);
        self.outbound
            .try_send(Outbound::Text(json))
            .map_err(|e| ConnectionError::Send(e.to_string()))
    }

    /// Fails every request still waiting for a response
    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pending = std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));
        for (_, waiter) in pending {
            let _ = waiter.send(Err(ConnectionError::Closed));
        }
    }
}

#[async_trait]
impl PeerConnection for WebSocketPeer {
    fn notify(&self, message: SocketMessage) -> Result<(), ConnectionError> {
        self.send(&Envelope::Notification {
            method: message.method,
            data: message.data,
        })
    }

    async fn request(&self, message: SocketMessage) -> Result<Value, ConnectionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (waiter, response) = oneshot::channel();
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(id, waiter);

        let sent = self.send(&Envelope::Request {
            id,
            method: message.method,
            data: message.data,
        });
        if let Err(e) = sent {
            self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => {
                self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                Err(ConnectionError::Timeout)
            }
        }
    }

    fn close(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.try_send(Outbound::Close);
        self.mark_closed();
    }
}
