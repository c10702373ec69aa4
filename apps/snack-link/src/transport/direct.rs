use std::sync::Arc;

use snack_proto::{DirectFrame, Metadata, TransportMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::{
    BackendKind, ConnectionStatus, EventKind, PresenceAction, Starter, Transport, TransportConfig,
    TransportCore, TransportError, TransportEvent, TransportHandler, TransportState,
};
use crate::channel::ChannelDescriptor;
use crate::dispatch::ListenerId;
use crate::telemetry;

/// Frames larger than this are treated as a corrupt stream.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// One end of a two-way frame channel between an editor and a runtime that
/// share a process, or talk over a pipe to a worker.
pub struct DirectLink {
    outbound: mpsc::UnboundedSender<DirectFrame>,
    inbound: mpsc::UnboundedReceiver<DirectFrame>,
}

impl DirectLink {
    /// Two cross-wired in-process ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: a_tx,
                inbound: b_rx,
            },
            Self {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }

    /// Wraps a byte stream carrying `u32` big-endian length-prefixed JSON
    /// frames. Spawns the read and write pumps on the current runtime.
    pub fn from_stream<S>(stream: S) -> Result<Self, TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(TransportError::NoRuntime);
        }
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<DirectFrame>();
        let (mut reader, mut writer) = tokio::io::split(stream);

        let _read_task: JoinHandle<()> = tokio::spawn(async move {
            loop {
                let mut len_buf = [0u8; 4];
                if reader.read_exact(&mut len_buf).await.is_err() {
                    break;
                }
                let len = u32::from_be_bytes(len_buf) as usize;
                if len > MAX_FRAME_BYTES {
                    tracing::warn!(
                        target = "snack::transport::direct",
                        len,
                        "frame exceeds limit; closing link"
                    );
                    break;
                }
                let mut buf = vec![0u8; len];
                if reader.read_exact(&mut buf).await.is_err() {
                    break;
                }
                match serde_json::from_slice::<DirectFrame>(&buf) {
                    Ok(frame) => {
                        if inbound_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "snack::transport::direct",
                            error = %err,
                            "ignoring undecodable frame"
                        );
                    }
                }
            }
        });

        let _write_task: JoinHandle<()> = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let bytes = match serde_json::to_vec(&frame) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        tracing::warn!(
                            target = "snack::transport::direct",
                            error = %err,
                            "failed to encode frame"
                        );
                        continue;
                    }
                };
                let Ok(len) = u32::try_from(bytes.len()) else {
                    continue;
                };
                if writer.write_all(&len.to_be_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        Ok(Self { outbound, inbound })
    }

    fn send(&self, frame: DirectFrame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    async fn recv(&mut self) -> Option<DirectFrame> {
        self.inbound.recv().await
    }
}

/// Transport over a [`DirectLink`]. No relay, no chunking and no reconnects:
/// when the link closes the peer is reported as gone.
pub struct DirectTransport {
    core: Arc<TransportCore>,
    driver: JoinHandle<()>,
}

impl DirectTransport {
    pub(crate) fn new(
        config: &TransportConfig,
        descriptor: ChannelDescriptor,
        link: DirectLink,
    ) -> (Self, Starter) {
        let (core, outbound) =
            TransportCore::new(BackendKind::Direct, descriptor, config.device_id.clone());
        let (starter, start) = Starter::pair();
        let span = telemetry::channel_span(core.channel_id(), &config.device_id);
        let driver = tokio::spawn(
            drive(
                Arc::clone(&core),
                config.metadata.clone(),
                link,
                start,
                outbound,
            )
            .instrument(span),
        );
        (Self { core, driver }, starter)
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        if self.core.state() != TransportState::Stopped {
            self.driver.abort();
        }
    }
}

impl Transport for DirectTransport {
    fn kind(&self) -> BackendKind {
        self.core.kind()
    }

    fn descriptor(&self) -> &ChannelDescriptor {
        self.core.descriptor()
    }

    fn device_id(&self) -> &str {
        self.core.device_id()
    }

    fn state(&self) -> TransportState {
        self.core.state()
    }

    fn post_message(&self, message: TransportMessage) {
        self.core.post(message);
    }

    fn add_listener(&self, kind: EventKind, handler: TransportHandler) -> ListenerId {
        self.core.add_listener(kind, handler)
    }

    fn remove_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        self.core.remove_listener(kind, id)
    }
}

async fn drive(
    core: Arc<TransportCore>,
    metadata: Metadata,
    mut link: DirectLink,
    start: oneshot::Receiver<()>,
    mut outbound: mpsc::UnboundedReceiver<TransportMessage>,
) {
    if start.await.is_err() {
        return;
    }
    core.emit_status(ConnectionStatus::Connecting);
    let hello = DirectFrame::Hello {
        device_id: core.device_id().to_string(),
        metadata,
    };
    let mut link_open = link.send(hello);
    if link_open {
        core.set_state(TransportState::Subscribed);
        core.emit_status(ConnectionStatus::Online);
    } else {
        link_closed(&core, None);
    }
    let mut peer: Option<(String, Metadata)> = None;

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else { break };
                let stop = message.is_stop();
                if link_open && !link.send(DirectFrame::Message { message }) {
                    link_open = false;
                    link_closed(&core, peer.take());
                } else if !link_open && !stop {
                    tracing::warn!(
                        target = "snack::transport::direct",
                        channel = core.channel_id(),
                        "link closed; dropping message"
                    );
                }
                if stop {
                    if link_open {
                        link.send(DirectFrame::Close);
                    }
                    break;
                }
            }
            frame = link.recv(), if link_open => {
                match frame {
                    Some(DirectFrame::Hello { device_id, metadata }) => {
                        tracing::debug!(
                            target = "snack::transport::direct",
                            channel = core.channel_id(),
                            peer = %device_id,
                            "peer announced"
                        );
                        peer = Some((device_id.clone(), metadata.clone()));
                        core.emit(TransportEvent::Presence {
                            device_id,
                            action: PresenceAction::Join,
                            metadata,
                        });
                    }
                    Some(DirectFrame::Message { message }) => {
                        if !message.addressed_to(core.device_id()) {
                            continue;
                        }
                        let stop = message.stops_channel(core.channel_id());
                        if stop {
                            core.set_state(TransportState::Stopped);
                        }
                        core.emit(TransportEvent::Message {
                            device_id: message.device_id.clone(),
                            message,
                        });
                        if stop {
                            break;
                        }
                    }
                    Some(DirectFrame::Close) | None => {
                        link_open = false;
                        link_closed(&core, peer.take());
                    }
                }
            }
        }
    }

    tracing::info!(
        target = "snack::transport::direct",
        channel = core.channel_id(),
        "transport stopped"
    );
    core.finish();
}

fn link_closed(core: &TransportCore, peer: Option<(String, Metadata)>) {
    if let Some((device_id, metadata)) = peer {
        core.emit(TransportEvent::Presence {
            device_id,
            action: PresenceAction::Leave,
            metadata,
        });
    }
    core.set_state(TransportState::Disconnected);
    core.emit_status(ConnectionStatus::Offline);
}
