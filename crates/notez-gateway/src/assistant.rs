use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use notez_types::events::ServerEvent;
use notez_types::models::Identity;

use crate::broadcaster::Broadcaster;
use crate::error::{GatewayError, GatewayResult};
use crate::mutation::validate_content;
use crate::store::Services;

struct PendingRequest {
    user_id: Uuid,
    /// Distinguishes a replaced task from its replacement under the same request id.
    ticket: Uuid,
    token: CancellationToken,
}

/// Delayed, cancellable assistant replies.
///
/// The reply is routed to the requester's identity at delivery time, so it
/// reaches whatever connections they have then, not the one that asked.
#[derive(Clone)]
pub struct AssistantScheduler {
    inner: Arc<AssistantInner>,
}

struct AssistantInner {
    services: Services,
    broadcaster: Broadcaster,
    delay: Duration,
    /// Parent of every request token; cancelled on shutdown.
    root: CancellationToken,
    /// request_id -> pending task
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
}

impl AssistantScheduler {
    pub fn new(services: Services, broadcaster: Broadcaster, delay: Duration) -> Self {
        Self {
            inner: Arc::new(AssistantInner {
                services,
                broadcaster,
                delay,
                root: CancellationToken::new(),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Announce the request to the room and schedule the reply.
    pub async fn request(
        &self,
        requester: &Identity,
        group_id: Uuid,
        prompt: &str,
        request_id: Option<Uuid>,
    ) -> GatewayResult<Uuid> {
        self.inner
            .services
            .require_member(group_id, requester.user_id)
            .await?;
        let prompt = validate_content(prompt)?;
        let request_id = request_id.unwrap_or_else(Uuid::new_v4);

        let ticket = Uuid::new_v4();
        let token = self.inner.root.child_token();
        {
            let mut pending = self.inner.pending.lock().await;
            if let Some(existing) = pending.get(&request_id) {
                if existing.user_id != requester.user_id {
                    return Err(GatewayError::Forbidden);
                }
            }
            let replaced = pending.insert(
                request_id,
                PendingRequest {
                    user_id: requester.user_id,
                    ticket,
                    token: token.clone(),
                },
            );
            if let Some(old) = replaced {
                debug!("Assistant request {} replaced", request_id);
                old.token.cancel();
            }
        }

        self.inner
            .broadcaster
            .broadcast(
                group_id,
                ServerEvent::AssistantStarted {
                    group_id,
                    request_id,
                    user_id: requester.user_id,
                    prompt: prompt.clone(),
                },
            )
            .await;

        let scheduler = self.clone();
        let user_id = requester.user_id;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!("Assistant request {} cancelled", request_id);
                }
                _ = tokio::time::sleep(scheduler.inner.delay) => {
                    let delivery = scheduler
                        .inner
                        .broadcaster
                        .send_to_identity(
                            user_id,
                            ServerEvent::AssistantResponse {
                                group_id,
                                request_id,
                                message: format!("AI Response to: \"{}\"", prompt),
                                timestamp: Utc::now(),
                            },
                        )
                        .await;
                    trace!(
                        "Assistant request {} answered on {}/{} connections",
                        request_id, delivery.delivered, delivery.attempted
                    );
                }
            }
            scheduler.finish(request_id, ticket).await;
        });

        Ok(request_id)
    }

    /// Cancel a pending request. Unknown or finished requests are a no-op
    /// (returns false); another user's request is forbidden.
    pub async fn cancel(&self, requester: &Identity, request_id: Uuid) -> GatewayResult<bool> {
        let mut pending = self.inner.pending.lock().await;
        match pending.get(&request_id) {
            None => Ok(false),
            Some(p) if p.user_id != requester.user_id => Err(GatewayError::Forbidden),
            Some(_) => {
                if let Some(p) = pending.remove(&request_id) {
                    p.token.cancel();
                }
                debug!("{} cancelled assistant request {}", requester.username, request_id);
                Ok(true)
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Cancel every outstanding request.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
    }

    async fn finish(&self, request_id: Uuid, ticket: Uuid) {
        let mut pending = self.inner.pending.lock().await;
        if pending.get(&request_id).is_some_and(|p| p.ticket == ticket) {
            pending.remove(&request_id);
        }
    }
}
