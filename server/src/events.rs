//! In-process typed domain events.
//!
//! Dispatch is asynchronous and best-effort: `publish` never blocks the
//! emitter, subscribers run on their own tasks, and a subscriber that falls
//! behind drops its own backlog without back-pressuring anyone.

use tokio::sync::broadcast;
use tracing::trace;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    EnvironmentActive {
        env_id: String,
        user_id: String,
        name: String,
    },
    EnvironmentError {
        env_id: String,
        user_id: String,
        name: String,
        message: String,
    },
    EnvironmentDeleted {
        env_id: String,
        user_id: String,
        name: String,
    },
    EnvironmentMadePublic {
        env_id: String,
        user_id: String,
        name: String,
        domain: String,
    },
    DeploymentStarted {
        deployment_id: String,
        job_id: String,
        user_id: String,
        env_name: String,
    },
    DeploymentSucceeded {
        deployment_id: String,
        job_id: String,
        user_id: String,
        env_name: String,
    },
    DeploymentFailed {
        deployment_id: String,
        job_id: String,
        user_id: String,
        env_name: String,
        message: String,
    },
    DeploymentStopped {
        deployment_id: String,
        job_id: String,
        user_id: String,
        env_name: String,
    },
    DeploymentRecovered {
        deployment_id: String,
        job_id: String,
        user_id: String,
        env_name: String,
    },
    DeploymentRecoveryFailed {
        deployment_id: String,
        job_id: String,
        user_id: String,
        env_name: String,
        message: String,
    },
}

impl Event {
    /// The dotted kind string, stable for subscribers and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::EnvironmentActive { .. } => "environment.active",
            Event::EnvironmentError { .. } => "environment.error",
            Event::EnvironmentDeleted { .. } => "environment.deleted",
            Event::EnvironmentMadePublic { .. } => "environment.made_public",
            Event::DeploymentStarted { .. } => "deployment.started",
            Event::DeploymentSucceeded { .. } => "deployment.success",
            Event::DeploymentFailed { .. } => "deployment.failed",
            Event::DeploymentStopped { .. } => "deployment.stopped",
            Event::DeploymentRecovered { .. } => "deployment.recovered",
            Event::DeploymentRecoveryFailed { .. } => "deployment.recovery-failed",
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Event::EnvironmentActive { user_id, .. }
            | Event::EnvironmentError { user_id, .. }
            | Event::EnvironmentDeleted { user_id, .. }
            | Event::EnvironmentMadePublic { user_id, .. }
            | Event::DeploymentStarted { user_id, .. }
            | Event::DeploymentSucceeded { user_id, .. }
            | Event::DeploymentFailed { user_id, .. }
            | Event::DeploymentStopped { user_id, .. }
            | Event::DeploymentRecovered { user_id, .. }
            | Event::DeploymentRecoveryFailed { user_id, .. } => user_id,
        }
    }

    pub fn is_deployment_event(&self) -> bool {
        self.kind().starts_with("deployment.")
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Fire-and-forget. Having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        trace!(kind = event.kind(), "publishing event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        let event = Event::DeploymentRecoveryFailed {
            deployment_id: "d".into(),
            job_id: "j".into(),
            user_id: "u".into(),
            env_name: "demo".into(),
            message: "image gone".into(),
        };
        assert_eq!(event.kind(), "deployment.recovery-failed");
        assert!(event.is_deployment_event());

        let event = Event::EnvironmentMadePublic {
            env_id: "e".into(),
            user_id: "u".into(),
            name: "demo".into(),
            domain: "app.example.com".into(),
        };
        assert_eq!(event.kind(), "environment.made_public");
        assert!(!event.is_deployment_event());
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(Event::EnvironmentActive {
            env_id: "e".into(),
            user_id: "u".into(),
            name: "demo".into(),
        });

        assert_eq!(first.recv().await.unwrap().kind(), "environment.active");
        assert_eq!(second.recv().await.unwrap().kind(), "environment.active");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        EventBus::new().publish(Event::EnvironmentDeleted {
            env_id: "e".into(),
            user_id: "u".into(),
            name: "demo".into(),
        });
    }
}
