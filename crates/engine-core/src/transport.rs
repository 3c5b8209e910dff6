//! Transport layer between the plugin runtime and the UI
//!
//! Provides in-memory channels. An embedding that talks to a real UI
//! implements [`PluginSender`] over its own message port.

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use figpad_protocol::{HostMessage, PluginMessage};

/// Sends messages from the plugin runtime to the UI
pub trait PluginSender {
    fn send(&self, message: PluginMessage) -> Result<(), TransportError>;
}

/// Sends messages from the UI to the plugin runtime
pub trait HostSender {
    fn send(&self, message: HostMessage) -> Result<(), TransportError>;
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Channel disconnected")]
    Disconnected,
    #[error("Transport error: {0}")]
    Other(String),
}

/// In-memory transport using tokio channels
pub struct InMemoryTransport;

impl InMemoryTransport {
    /// Create a connected pair
    ///
    /// Returns (ui_side, plugin_side) handles
    pub fn new() -> (UiTransport, PluginTransport) {
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (plugin_tx, plugin_rx) = mpsc::unbounded_channel();

        let ui = UiTransport { host_tx, plugin_rx };
        let plugin = PluginTransport {
            host_rx,
            outbox: Outbox(plugin_tx),
        };

        (ui, plugin)
    }
}

/// UI-side transport handle
pub struct UiTransport {
    host_tx: UnboundedSender<HostMessage>,
    plugin_rx: UnboundedReceiver<PluginMessage>,
}

impl UiTransport {
    /// Next message from the plugin; `None` once the plugin side is gone
    pub async fn recv(&mut self) -> Option<PluginMessage> {
        self.plugin_rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Option<PluginMessage>, TransportError> {
        match self.plugin_rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    /// Sender that can be moved into other tasks
    pub fn sender(&self) -> UiSender {
        UiSender(self.host_tx.clone())
    }
}

impl HostSender for UiTransport {
    fn send(&self, message: HostMessage) -> Result<(), TransportError> {
        self.host_tx
            .send(message)
            .map_err(|_| TransportError::Disconnected)
    }
}

/// Cloneable UI → plugin sender
#[derive(Clone)]
pub struct UiSender(UnboundedSender<HostMessage>);

impl HostSender for UiSender {
    fn send(&self, message: HostMessage) -> Result<(), TransportError> {
        self.0.send(message).map_err(|_| TransportError::Disconnected)
    }
}

/// Plugin-side transport handle
pub struct PluginTransport {
    host_rx: UnboundedReceiver<HostMessage>,
    outbox: Outbox,
}

impl PluginTransport {
    /// Next message from the UI; `None` once the UI side is gone
    pub async fn recv(&mut self) -> Option<HostMessage> {
        self.host_rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Option<HostMessage>, TransportError> {
        match self.host_rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }
}

/// Cloneable plugin → UI sender
#[derive(Clone)]
pub struct Outbox(UnboundedSender<PluginMessage>);

impl PluginSender for Outbox {
    fn send(&self, message: PluginMessage) -> Result<(), TransportError> {
        self.0.send(message).map_err(|_| TransportError::Disconnected)
    }
}

impl PluginSender for PluginTransport {
    fn send(&self, message: PluginMessage) -> Result<(), TransportError> {
        self.outbox.send(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figpad_protocol::{CtrlSignal, RequestId, WorkerId};

    #[tokio::test]
    async fn roundtrip_host_plugin() {
        let (mut ui, mut plugin) = InMemoryTransport::new();

        ui.send(HostMessage::StopScript {
            id: RequestId::new("r1"),
        })
        .unwrap();
        assert_eq!(
            plugin.recv().await,
            Some(HostMessage::StopScript {
                id: RequestId::new("r1")
            })
        );

        let worker_id = WorkerId("r1.0".into());
        plugin
            .outbox()
            .send(PluginMessage::WorkerCtrl {
                signal: CtrlSignal::Terminate,
                worker_id: worker_id.clone(),
            })
            .unwrap();
        match ui.recv().await {
            Some(PluginMessage::WorkerCtrl { worker_id: got, .. }) => assert_eq!(got, worker_id),
            other => panic!("unexpected {other:?}"),
        }
        assert!(ui.try_recv().unwrap().is_none());
    }

    #[test]
    fn send_after_drop_reports_disconnect() {
        let (ui, plugin) = InMemoryTransport::new();
        let outbox = plugin.outbox();
        drop(ui);
        let err = outbox
            .send(PluginMessage::worker_message(WorkerId("x.0".into()), serde_json::Value::Null))
            .unwrap_err();
        assert!(matches!(err, TransportError::Disconnected));
    }
}
