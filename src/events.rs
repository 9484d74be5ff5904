//! The internal event bus: the three deployment-lifecycle payloads and the
//! publish/subscribe point the job runner uses to schedule its own retries.

use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct DeploymentStarted {
  pub deployment_id: Uuid,
  /// Decrypted channel-bot token, carried on the event so the Job Runner
  /// never has to hold a second decryption path outside the repository.
  pub channel_token: String,
  pub gateway_token: Option<String>,
  pub attempt: u32,
  pub failed_dseqs: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct DeploymentCompleted {
  pub deployment_id: Uuid,
}

#[derive(Clone, Debug)]
pub struct DeploymentFailed {
  pub deployment_id: Uuid,
  pub error: String,
}

#[derive(Clone, Debug)]
pub enum Event {
  DeploymentStarted(DeploymentStarted),
  DeploymentCompleted(DeploymentCompleted),
  DeploymentFailed(DeploymentFailed),
}

/// Publish/subscribe point for the three deployment-lifecycle event payloads.
/// `publish` never blocks: a topic with no subscribers simply drops the
/// event, matching the fire-and-forget posture the job runner's retry path
/// needs.
pub trait Service: Send + Sync + 'static {
  fn publish(&self, event: Event);
  fn subscribe(&self) -> broadcast::Receiver<Event>;
}

struct Implementation {
  sender: broadcast::Sender<Event>,
}

pub fn new_service() -> impl Service {
  let (sender, _) = broadcast::channel(256);
  Implementation { sender }
}

impl Service for Implementation {
  fn publish(&self, event: Event) {
    // A send with no receivers is not an error: nothing is listening yet
    // (e.g. in a unit test that only cares about the repository side effects).
    let _ = self.sender.send(event);
  }

  fn subscribe(&self) -> broadcast::Receiver<Event> {
    self.sender.subscribe()
  }
}
