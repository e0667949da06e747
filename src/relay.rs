use crate::context::{AbortOnDrop, CallContext};
use crate::envelope::Envelope;
use crate::error::DispatchError;
use crate::provider::FrameStream;
use crate::thinking::ThinkingState;
use bytes::Bytes;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Idle time after which a heartbeat comment is written to the client.
pub const IDLE_HEARTBEAT: Duration = Duration::from_millis(500);
pub const HEARTBEAT_FRAME: &[u8] = b": MINIROUTER PROCESSING\n\n";

const DATA_PREFIX: &[u8] = b"data:";
const PULL_BUFFER: usize = 16;

enum Pulled {
    Data(Bytes),
    Error(DispatchError),
    End,
}

/// Outbound half of a streaming response. The first byte written commits the
/// response: from then on the HTTP status is fixed and dispatch may not fall back
/// to another candidate.
#[derive(Debug)]
pub struct ClientSink {
    tx: mpsc::Sender<Bytes>,
    commit: Option<oneshot::Sender<()>>,
}

impl ClientSink {
    pub fn new(tx: mpsc::Sender<Bytes>, commit: oneshot::Sender<()>) -> Self {
        Self {
            tx,
            commit: Some(commit),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.commit.is_none()
    }

    pub async fn send(&mut self, bytes: Bytes) -> Result<(), DispatchError> {
        if let Some(commit) = self.commit.take() {
            let _ = commit.send(());
        }
        self.tx.send(bytes).await.map_err(|_| DispatchError::Canceled)
    }

    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Copies upstream frames to the client, writing a heartbeat whenever the upstream
/// has been quiet for the idle threshold.
#[derive(Debug, Clone)]
pub struct StreamRelay {
    supports_thinking: bool,
    idle: Duration,
}

impl StreamRelay {
    pub fn new(supports_thinking: bool) -> Self {
        Self {
            supports_thinking,
            idle: IDLE_HEARTBEAT,
        }
    }

    pub fn with_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    /// Runs until the upstream ends (`Ok`), fails, or the client goes away (`Err`).
    pub async fn run(
        &self,
        ctx: &CallContext,
        frames: FrameStream,
        sink: &mut ClientSink,
    ) -> Result<(), DispatchError> {
        let (tx, mut rx) = mpsc::channel::<Pulled>(PULL_BUFFER);
        let producer_ctx = ctx.clone();
        let _producer = AbortOnDrop::new(tokio::spawn(async move {
            let mut frames = frames;
            loop {
                let pulled = tokio::select! {
                    _ = producer_ctx.cancelled() => Pulled::Error(DispatchError::Canceled),
                    next = frames.next() => match next {
                        Some(Ok(chunk)) => Pulled::Data(chunk),
                        Some(Err(err)) => Pulled::Error(err),
                        None => Pulled::End,
                    },
                };
                let terminal = !matches!(pulled, Pulled::Data(_));
                if tx.send(pulled).await.is_err() || terminal {
                    return;
                }
            }
        }));

        let mut thinking = ThinkingState::default();
        loop {
            let waited = tokio::select! {
                _ = sink.closed() => {
                    ctx.cancel();
                    return Err(DispatchError::Canceled);
                }
                waited = tokio::time::timeout(self.idle, rx.recv()) => waited,
            };
            let outbound = match waited {
                Err(_) => Bytes::from_static(HEARTBEAT_FRAME),
                Ok(None) | Ok(Some(Pulled::End)) => return Ok(()),
                Ok(Some(Pulled::Error(err))) => return Err(err),
                Ok(Some(Pulled::Data(chunk))) => self.reframe(chunk, &mut thinking)?,
            };
            if let Err(err) = sink.send(outbound).await {
                ctx.cancel();
                return Err(err);
            }
        }
    }

    fn reframe(&self, chunk: Bytes, thinking: &mut ThinkingState) -> Result<Bytes, DispatchError> {
        let trimmed = chunk.trim_ascii();
        if !(trimmed.starts_with(b":") || trimmed.starts_with(DATA_PREFIX)) {
            return Err(DispatchError::Protocol(
                String::from_utf8_lossy(trimmed).into_owned(),
            ));
        }
        if !self.supports_thinking || !trimmed.starts_with(DATA_PREFIX) {
            return Ok(chunk);
        }

        let payload = trimmed[DATA_PREFIX.len()..].trim_ascii();
        let Ok(mut frame) = Envelope::from_slice(payload) else {
            return Ok(chunk);
        };
        thinking.rewrite(&mut frame);
        let json = frame
            .to_bytes()
            .map_err(|err| DispatchError::Protocol(err.to_string()))?;
        let mut out = Vec::with_capacity(json.len() + 8);
        out.extend_from_slice(b"data: ");
        out.extend_from_slice(&json);
        out.extend_from_slice(b"\n\n");
        Ok(Bytes::from(out))
    }
}
