//! Outbound half of the application API.

use tokio::sync::oneshot;

use crate::ipc::client::OutboundItem;
use crate::message::Message;
use crate::{Ipc, IpcError, Result, SendOptions};

impl Ipc {
    /// Broadcast `message` to every other participant.
    ///
    /// Blocks until the session's writer has taken the message, so it waits
    /// for a session when none is established. Write failures are not
    /// reported; use [`send_and_wait`](Self::send_and_wait) for that.
    pub async fn send<T: Message>(&self, message: T) -> Result<()> {
        self.send_with(message, SendOptions::default()).await
    }

    /// Broadcast `message` and wait until it has been written to the broker.
    ///
    /// This confirms transmission only, not processing by any receiver.
    pub async fn send_and_wait<T: Message>(&self, message: T) -> Result<()> {
        self.send_with(
            message,
            SendOptions {
                wait: true,
                ..SendOptions::default()
            },
        )
        .await
    }

    /// Broadcast with explicit options.
    pub async fn send_with<T: Message>(&self, message: T, options: SendOptions) -> Result<()> {
        let key = self.state().registry.register::<T>();

        let (done, outcome) = if options.wait {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (taken, handed_over) = oneshot::channel();

        self.state()
            .outbound_tx
            .send(OutboundItem {
                key,
                message: Box::new(message),
                self_receive: options.self_receive,
                taken: Some(taken),
                done,
            })
            .await
            .map_err(|_| IpcError::Other("outbound queue closed".to_string()))?;

        // The single queue slot only parks the item; the writer taking it is
        // the hand-off.
        handed_over.await.map_err(|_| IpcError::ConnectionWriteFailed {
            message: "message dropped before the writer took it".to_string(),
            source: None,
        })?;

        match outcome {
            Some(rx) => rx.await.map_err(|_| IpcError::ConnectionWriteFailed {
                message: "session ended before the message was written".to_string(),
                source: None,
            })?,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Ipc, Json};
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_blocks_until_writer_takes_item() {
        let ipc = Ipc::builder("/tmp/udsbus-send-test.sock", "secret")
            .build()
            .unwrap();

        // No session yet: the item sits in the slot but nobody took it.
        let sender = ipc.clone();
        let mut pending =
            tokio::spawn(async move { sender.send(Json("hello".to_string())).await });
        let early = tokio::time::timeout(Duration::from_millis(100), &mut pending).await;
        assert!(early.is_err(), "send returned before the writer took the item");

        let mut outbound = ipc.state().outbound_rx.lock().await;
        let mut item = outbound.recv().await.unwrap();
        assert!(!item.self_receive);
        assert!(item.done.is_none());
        item.taken.take().unwrap().send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_item_reports_write_failure() {
        let ipc = Ipc::builder("/tmp/udsbus-send-test.sock", "secret")
            .build()
            .unwrap();

        let sender = ipc.clone();
        let pending = tokio::spawn(async move { sender.send(Json(1u32)).await });

        let item = ipc.state().outbound_rx.lock().await.recv().await.unwrap();
        drop(item);

        let result = pending.await.unwrap();
        assert!(matches!(
            result,
            Err(crate::IpcError::ConnectionWriteFailed { .. })
        ));
    }
}
