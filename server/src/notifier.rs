//! Fans domain events out to the chat channel, honoring per-user
//! notification preferences. Delivery failures are logged and dropped;
//! nothing here may ever propagate back to an emitter.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::{Event, EventBus};
use crate::persistence::Persistence;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat api request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("chat api rejected the message: {0}")]
    Rejected(String),
}

/// The out-of-band delivery channel.
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), ChatError>;
}

/// Telegram-style bot API sink: `POST {base}/bot{token}/sendMessage`.
pub struct TelegramSink {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl TelegramSink {
    pub fn new(base: String, token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
            token,
        }
    }
}

#[async_trait]
impl ChatSink for TelegramSink {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), ChatError> {
        let url = format!("{}/bot{}/sendMessage", self.base, self.token);
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ChatError::Rejected(response.status().to_string()));
        }

        Ok(())
    }
}

/// Used when no bot token is configured: messages vanish, loudly enough for
/// operators to notice in logs.
pub struct NullSink;

#[async_trait]
impl ChatSink for NullSink {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), ChatError> {
        debug!(chat_id, text, "chat sink disabled, dropping notification");
        Ok(())
    }
}

pub struct Notifier {
    store: Persistence,
    sink: Arc<dyn ChatSink>,
}

impl Notifier {
    pub fn new(store: Persistence, sink: Arc<dyn ChatSink>) -> Self {
        Self { store, sink }
    }

    /// Subscribe to the bus and consume events until the bus is dropped.
    pub fn spawn(self, bus: &EventBus) -> JoinHandle<()> {
        let mut receiver = bus.subscribe();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => self.handle(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notifier fell behind, dropped events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn handle(&self, event: Event) {
        let user = match self.store.users().get(event.user_id()).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                debug!(user_id = event.user_id(), "event for unknown user, skipping");
                return;
            }
            Err(err) => {
                warn!(error = %err, "could not resolve event user");
                return;
            }
        };

        let wanted = if event.is_deployment_event() {
            user.notify_deployments
        } else {
            user.notify_environments
        };
        if !wanted {
            return;
        }

        if let Err(err) = self.sink.send(user.chat_id, &render(&event)).await {
            warn!(error = %err, kind = event.kind(), "notification delivery failed");
        }
    }
}

/// Human line for the chat channel.
pub fn render(event: &Event) -> String {
    match event {
        Event::EnvironmentActive { name, .. } => {
            format!("Environment '{name}' is ready.")
        }
        Event::EnvironmentError { name, message, .. } => {
            format!("Environment '{name}' hit an error: {message}")
        }
        Event::EnvironmentDeleted { name, .. } => {
            format!("Environment '{name}' was deleted.")
        }
        Event::EnvironmentMadePublic { name, domain, .. } => {
            format!("Environment '{name}' is now public at https://{domain}")
        }
        Event::DeploymentStarted { job_id, env_name, .. } => {
            format!("Deployment {job_id} in '{env_name}' started.")
        }
        Event::DeploymentSucceeded { job_id, env_name, .. } => {
            format!("Deployment {job_id} in '{env_name}' is running.")
        }
        Event::DeploymentFailed {
            job_id,
            env_name,
            message,
            ..
        } => format!("Deployment {job_id} in '{env_name}' failed: {message}"),
        Event::DeploymentStopped { job_id, env_name, .. } => {
            format!("Deployment {job_id} in '{env_name}' was stopped.")
        }
        Event::DeploymentRecovered { job_id, env_name, .. } => {
            format!("Deployment {job_id} in '{env_name}' was recovered after a restart.")
        }
        Event::DeploymentRecoveryFailed {
            job_id,
            env_name,
            message,
            ..
        } => format!("Deployment {job_id} in '{env_name}' could not be recovered: {message}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl ChatSink for RecordingSink {
        async fn send(&self, chat_id: i64, text: &str) -> Result<(), ChatError> {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }
    }

    async fn drain(sink: &RecordingSink) -> Vec<(i64, String)> {
        // Give the notifier task a few scheduling turns to catch up.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let sent = sink.sent.lock().unwrap().clone();
            if !sent.is_empty() {
                return sent;
            }
        }
        sink.sent.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn delivers_to_the_event_owner() {
        let store = Persistence::new_in_memory().await;
        let user = store.users().upsert_by_chat_id(99, None).await.unwrap();

        let sink = Arc::new(RecordingSink::default());
        let bus = EventBus::new();
        let _task = Notifier::new(store, sink.clone()).spawn(&bus);

        bus.publish(Event::DeploymentFailed {
            deployment_id: "d1".into(),
            job_id: "jobjobjobjobjob1".into(),
            user_id: user.user_id,
            env_name: "demo".into(),
            message: "pull failed".into(),
        });

        let sent = drain(&sink).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 99);
        assert!(sent[0].1.contains("pull failed"));
    }

    #[tokio::test]
    async fn respects_muted_preferences() {
        let store = Persistence::new_in_memory().await;
        let user = store.users().upsert_by_chat_id(7, None).await.unwrap();
        store
            .users()
            .set_notifications(&user.user_id, false, true)
            .await
            .unwrap();

        let sink = Arc::new(RecordingSink::default());
        let bus = EventBus::new();
        let _task = Notifier::new(store, sink.clone()).spawn(&bus);

        bus.publish(Event::DeploymentStarted {
            deployment_id: "d1".into(),
            job_id: "jobjobjobjobjob1".into(),
            user_id: user.user_id.clone(),
            env_name: "demo".into(),
        });
        bus.publish(Event::EnvironmentActive {
            env_id: "e1".into(),
            user_id: user.user_id,
            name: "demo".into(),
        });

        let sent = drain(&sink).await;
        assert_eq!(sent.len(), 1, "deployment event should have been muted");
        assert!(sent[0].1.contains("ready"));
    }
}
