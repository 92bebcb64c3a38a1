use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::ClientConfig;
use crate::device_client::{DeviceClient, ReplyTo};
use crate::target::TargetAddr;

/// Process-wide map of device clients, one per target, with get-or-create
///  semantics. The map is the only state shared across targets; each client
///  owns its socket and queue exclusively.
///
/// The lock is held across client start-up so that concurrent first requests
///  for the same target cannot spawn two actors.
pub struct ClientRegistry {
    config: ClientConfig,
    clients: Mutex<FxHashMap<TargetAddr, DeviceClient>>,
}

impl ClientRegistry {
    pub fn new(config: ClientConfig) -> ClientRegistry {
        ClientRegistry {
            config,
            clients: Mutex::new(FxHashMap::default()),
        }
    }

    /// Idempotent: the first call for a target spawns its actor, later calls
    ///  return a handle to the same actor. Fails only if the actor's socket
    ///  cannot be opened.
    pub async fn get_client(&self, target: TargetAddr) -> anyhow::Result<DeviceClient> {
        let mut clients = self.clients.lock().await;

        if let Some(client) = clients.get(&target) {
            return Ok(client.clone());
        }

        debug!("no device client for {} yet - starting one", target);
        let client = DeviceClient::start(target, self.config).await?;
        clients.insert(target, client.clone());
        Ok(client)
    }

    /// Route a request to the target's device client, spawning it on first
    ///  use. Returns as soon as the request is queued; the response arrives
    ///  on `reply_to`.
    pub async fn enqueue(
        &self,
        target: TargetAddr,
        request: Vec<u8>,
        reply_to: ReplyTo,
    ) -> anyhow::Result<()> {
        self.get_client(target).await?.enqueue(request, reply_to)
    }
}

impl Default for ClientRegistry {
    fn default() -> ClientRegistry {
        ClientRegistry::new(ClientConfig::default())
    }
}
