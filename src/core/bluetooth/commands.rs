//! Sending commands to a die and pairing them with their responses.
//!
//! Responses are correlated purely by message kind. At most one request per
//! response kind is outstanding per die; a second request for the same kind
//! queues (FIFO) until the first resolves, fails or times out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::oneshot;

use crate::core::bluetooth::constants::UUID_PIXELS_WRITE_CHAR;
use crate::core::bluetooth::transport::Connection;
use crate::core::protocol::{Message, MessageKind, encode};
use crate::error::{PixelsError, Result, TransportError};
use crate::utils::lock;

/// Command sender trait
#[async_trait::async_trait]
pub trait CommandSender: Send + Sync {
    /// Send a command to the die
    async fn send_command(&self, message: &Message) -> Result<(), TransportError>;
}

/// Writes encoded frames to the die's write characteristic.
#[derive(Clone)]
pub struct LinkCommandSender {
    connection: Arc<dyn Connection>,
}

impl LinkCommandSender {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self { connection }
    }
}

#[async_trait::async_trait]
impl CommandSender for LinkCommandSender {
    async fn send_command(&self, message: &Message) -> Result<(), TransportError> {
        let data = encode(message);
        debug!(
            "Sending {:?} to {}: {:02x?}",
            message.kind(),
            self.connection.address(),
            data
        );
        self.connection
            .write_without_response(UUID_PIXELS_WRITE_CHAR, &data)
            .await
    }
}

type Reply = Result<Message>;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Reply>,
}

/// In-flight requests keyed by the response kind they wait for.
///
/// Holds the sender of the current link; without one the table is closed and
/// refuses new requests.
#[derive(Default)]
struct PendingCommands {
    next_id: u64,
    waiters: HashMap<MessageKind, Waiter>,
    sender: Option<Arc<dyn CommandSender>>,
}

impl PendingCommands {
    fn sender(&self) -> Result<Arc<dyn CommandSender>> {
        self.sender.clone().ok_or(PixelsError::NotConnected)
    }

    fn register(
        &mut self,
        kind: MessageKind,
    ) -> Result<(u64, oneshot::Receiver<Reply>, Arc<dyn CommandSender>)> {
        let sender = self.sender()?;
        self.next_id += 1;
        let id = self.next_id;
        let (tx, rx) = oneshot::channel();
        if let Some(stale) = self.waiters.insert(kind, Waiter { id, tx }) {
            warn!("Replacing stale waiter {} for {:?}", stale.id, kind);
            let _ = stale.tx.send(Err(PixelsError::Disconnected));
        }
        Ok((id, rx, sender))
    }

    fn remove(&mut self, kind: MessageKind, id: u64) -> bool {
        match self.waiters.get(&kind) {
            Some(waiter) if waiter.id == id => {
                self.waiters.remove(&kind);
                true
            }
            _ => false,
        }
    }
}

/// Deregisters a waiter when its request finishes, times out or is cancelled
/// by dropping the future.
struct PendingGuard {
    pending: Arc<Mutex<PendingCommands>>,
    kind: MessageKind,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if lock(&self.pending).remove(self.kind, self.id) {
            debug!("Deregistered pending {:?} request {}", self.kind, self.id);
        }
    }
}

/// Request/response pairing for one die.
pub struct CommandDispatcher {
    pending: Arc<Mutex<PendingCommands>>,
    gates: Mutex<HashMap<MessageKind, Arc<tokio::sync::Mutex<()>>>>,
    timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(PendingCommands::default())),
            gates: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Opens the table for a freshly established link.
    pub fn attach(&self, sender: Arc<dyn CommandSender>) {
        lock(&self.pending).sender = Some(sender);
    }

    /// Closes the table and fails every waiter with `Disconnected`.
    pub fn detach(&self) -> usize {
        let waiters: Vec<Waiter> = {
            let mut pending = lock(&self.pending);
            pending.sender = None;
            pending.waiters.drain().map(|(_, w)| w).collect()
        };
        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.tx.send(Err(PixelsError::Disconnected));
        }
        if count > 0 {
            info!("Failed {} pending command(s) on disconnect", count);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).waiters.len()
    }

    /// Hands `message` to the request waiting for its kind. Returns the
    /// message back when nobody is waiting for it.
    pub fn route(&self, message: Message) -> Option<Message> {
        let waiter = lock(&self.pending).waiters.remove(&message.kind());
        match waiter {
            Some(waiter) => {
                debug!("Resolving pending request {} with {:?}", waiter.id, message.kind());
                if let Err(Ok(message)) = waiter.tx.send(Ok(message)) {
                    // The waiter went away between lookup and delivery.
                    return Some(message);
                }
                None
            }
            None => Some(message),
        }
    }

    /// Fire-and-forget send for commands the die never acknowledges.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let sender = lock(&self.pending).sender()?;
        sender.send_command(message).await?;
        Ok(())
    }

    /// Sends `request` and waits for the next message of kind `response`.
    pub async fn send_and_wait(&self, request: &Message, response: MessageKind) -> Result<Message> {
        let gate = {
            let mut gates = lock(&self.gates);
            gates.entry(response).or_default().clone()
        };
        let _turn = gate.lock_owned().await;

        let (id, rx, sender) = lock(&self.pending).register(response)?;
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            kind: response,
            id,
        };

        sender.send_command(request).await?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(PixelsError::Disconnected),
            Err(_) => {
                warn!(
                    "No {:?} within {:?} after sending {:?}",
                    response,
                    self.timeout,
                    request.kind()
                );
                Err(PixelsError::Timeout { kind: response })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::{BlinkId, RollState, RollStateKind};

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<MessageKind>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl CommandSender for RecordingSender {
        async fn send_command(&self, message: &Message) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::NotConnected);
            }
            self.sent.lock().unwrap().push(message.kind());
            Ok(())
        }
    }

    fn dispatcher(timeout_ms: u64) -> (Arc<CommandDispatcher>, Arc<RecordingSender>) {
        let dispatcher = Arc::new(CommandDispatcher::new(Duration::from_millis(timeout_ms)));
        let sender = Arc::new(RecordingSender::default());
        dispatcher.attach(sender.clone());
        (dispatcher, sender)
    }

    async fn wait_for_pending(dispatcher: &CommandDispatcher, count: usize) {
        while dispatcher.pending_count() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_response_resolves_waiter() {
        let (dispatcher, sender) = dispatcher(1_000);
        let d = dispatcher.clone();
        let task = tokio::spawn(async move {
            d.send_and_wait(&Message::RequestRollState, MessageKind::RollState)
                .await
        });
        wait_for_pending(&dispatcher, 1).await;

        let reply = Message::RollState(RollState {
            state: RollStateKind::OnFace,
            face: 4,
        });
        assert_eq!(dispatcher.route(reply.clone()), None);
        assert_eq!(task.await.unwrap().unwrap(), reply);
        assert_eq!(*sender.sent.lock().unwrap(), [MessageKind::RequestRollState]);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unsolicited_message_is_returned() {
        let (dispatcher, _) = dispatcher(1_000);
        assert_eq!(dispatcher.route(Message::Rssi(-40)), Some(Message::Rssi(-40)));
    }

    #[tokio::test]
    async fn test_timeout_removes_waiter() {
        let (dispatcher, _) = dispatcher(20);
        let err = dispatcher
            .send_and_wait(&Message::RequestRssi(Default::default()), MessageKind::Rssi)
            .await
            .unwrap_err();
        assert!(matches!(err, PixelsError::Timeout { kind: MessageKind::Rssi }));
        assert_eq!(dispatcher.pending_count(), 0);
        // A late reply is no longer claimed by anyone.
        assert_eq!(dispatcher.route(Message::Rssi(-50)), Some(Message::Rssi(-50)));
    }

    #[tokio::test]
    async fn test_cancelled_wait_deregisters() {
        let (dispatcher, _) = dispatcher(10_000);
        let wait = dispatcher.send_and_wait(&Message::WhoAreYou, MessageKind::IAmADie);
        let outer = tokio::time::timeout(Duration::from_millis(20), wait).await;
        assert!(outer.is_err());
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_detach_fails_all_waiters() {
        let (dispatcher, _) = dispatcher(10_000);
        let d1 = dispatcher.clone();
        let first = tokio::spawn(async move {
            d1.send_and_wait(&Message::RequestBatteryLevel, MessageKind::BatteryLevel)
                .await
        });
        let d2 = dispatcher.clone();
        let second = tokio::spawn(async move {
            let blink = Message::BlinkId(BlinkId {
                brightness: 0x80,
                looping: false,
            });
            d2.send_and_wait(&blink, MessageKind::BlinkIdAck).await
        });
        wait_for_pending(&dispatcher, 2).await;

        assert_eq!(dispatcher.detach(), 2);

        assert!(matches!(first.await.unwrap(), Err(PixelsError::Disconnected)));
        assert!(matches!(second.await.unwrap(), Err(PixelsError::Disconnected)));
        assert!(matches!(
            dispatcher.send(&Message::StopAllAnimations).await,
            Err(PixelsError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_requests_without_link_report_not_connected() {
        let dispatcher = CommandDispatcher::new(Duration::from_secs(1));
        assert!(matches!(
            dispatcher.send(&Message::StopAllAnimations).await,
            Err(PixelsError::NotConnected)
        ));
        assert!(matches!(
            dispatcher
                .send_and_wait(&Message::RequestRollState, MessageKind::RollState)
                .await,
            Err(PixelsError::NotConnected)
        ));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_same_kind_requests_queue_in_order() {
        let (dispatcher, sender) = dispatcher(1_000);
        let d1 = dispatcher.clone();
        let first = tokio::spawn(async move {
            d1.send_and_wait(&Message::RequestRssi(Default::default()), MessageKind::Rssi)
                .await
        });
        wait_for_pending(&dispatcher, 1).await;
        let d2 = dispatcher.clone();
        let second = tokio::spawn(async move {
            d2.send_and_wait(&Message::RequestRssi(Default::default()), MessageKind::Rssi)
                .await
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // Second request has not been written while the first is outstanding.
        assert_eq!(sender.sent.lock().unwrap().len(), 1);

        assert_eq!(dispatcher.route(Message::Rssi(-10)), None);
        assert_eq!(first.await.unwrap().unwrap(), Message::Rssi(-10));
        wait_for_pending(&dispatcher, 1).await;
        assert_eq!(dispatcher.route(Message::Rssi(-20)), None);
        assert_eq!(second.await.unwrap().unwrap(), Message::Rssi(-20));
        assert_eq!(sender.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_write_failure_is_surfaced_and_deregistered() {
        let dispatcher = CommandDispatcher::new(Duration::from_secs(1));
        dispatcher.attach(Arc::new(RecordingSender {
            fail: true,
            ..Default::default()
        }));
        let err = dispatcher
            .send_and_wait(&Message::WhoAreYou, MessageKind::IAmADie)
            .await
            .unwrap_err();
        assert!(matches!(err, PixelsError::Transport(TransportError::NotConnected)));
        assert_eq!(dispatcher.pending_count(), 0);
    }
}
