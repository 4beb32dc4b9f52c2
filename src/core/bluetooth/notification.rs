//! Notification handling for a connected die
//! This module pumps notification frames into the command dispatcher and the die's cache

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, info, warn};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::connection::spawn_link_lost;
use crate::core::die::DieShared;
use crate::core::protocol::decode;

pub struct NotificationHandler;

impl NotificationHandler {
    /// Start the task that processes notifications until `cancel` fires or
    /// the stream ends.
    pub(crate) fn setup_notifications(
        die: Weak<DieShared>,
        notifications: BoxStream<'static, Vec<u8>>,
        cancel: CancellationToken,
        generation: u64,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::process_notifications(
            die,
            notifications,
            cancel,
            generation,
        ))
    }

    async fn process_notifications(
        die: Weak<DieShared>,
        mut notifications: BoxStream<'static, Vec<u8>>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        info!("Listening for die notifications...");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Notification pump cancelled");
                    break;
                }
                frame = notifications.next() => match frame {
                    Some(frame) => {
                        let Some(shared) = die.upgrade() else {
                            break;
                        };
                        Self::handle_frame(&shared, &frame);
                    }
                    None => {
                        spawn_link_lost(die.clone(), generation);
                        break;
                    }
                }
            }
        }

        info!("Notification stream ended");
    }

    /// Decode one frame, apply it to the die, then hand it to the request
    /// waiting for its kind, if any.
    ///
    /// State carried by a response is applied here, in arrival order, before
    /// the waiter resumes.
    pub(crate) fn handle_frame(die: &Arc<DieShared>, frame: &[u8]) {
        let message = match decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping frame from {}: {} ({:02x?})", die.address, e, frame);
                return;
            }
        };
        debug!("Received {:?} from {}", message, die.address);

        die.publish(&message);
        if let Some(unclaimed) = die.commands.route(message) {
            debug!("No request waiting for {:?}", unclaimed.kind());
        }
    }
}
