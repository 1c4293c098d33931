//! Lazy fragment producer of one recording session

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, Stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::controller::SessionTable;
use super::types::{RecordingError, RecordingResult, StreamId};
use crate::mp4::{BoxReader, Fragment, FragmentAssembler};
use crate::transcoder::{ByteSource, OutputEndpoint};

/// One item delivered to the recording consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingPacket {
    pub data: Bytes,
    pub is_init_segment: bool,
    /// Hint that no more data follows. Only set on an empty packet after the
    /// transcoder output ended on its own.
    pub is_last: bool,
}

impl RecordingPacket {
    fn terminal() -> Self {
        Self {
            data: Bytes::new(),
            is_init_segment: false,
            is_last: true,
        }
    }
}

impl From<Fragment> for RecordingPacket {
    fn from(fragment: Fragment) -> Self {
        Self {
            data: fragment.data,
            is_init_segment: fragment.is_init_segment,
            is_last: false,
        }
    }
}

/// Everything the producer needs besides its current phase
pub(crate) struct SessionContext {
    pub stream_id: StreamId,
    pub session_id: u64,
    pub camera: String,
    pub connect_timeout: Duration,
    pub max_box_size: usize,
    pub cancel: CancellationToken,
    pub closed_externally: Arc<AtomicBool>,
    pub sessions: Arc<SessionTable>,
}

impl SessionContext {
    /// Tears the session down unless a close already did.
    async fn release(&self) {
        self.sessions.release(self.stream_id, self.session_id).await;
    }
}

enum Phase {
    Connecting(OutputEndpoint),
    Streaming {
        reader: BoxReader<ByteSource>,
        assembler: FragmentAssembler,
    },
    Done,
}

struct Producer {
    phase: Phase,
    ctx: SessionContext,
}

impl Producer {
    async fn next_item(mut self) -> Option<(RecordingResult<RecordingPacket>, Self)> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Done => return None,
                Phase::Connecting(endpoint) => {
                    let connected = tokio::select! {
                        _ = self.ctx.cancel.cancelled() => None,
                        connected = endpoint.connect(self.ctx.connect_timeout) => Some(connected),
                    };

                    match connected {
                        None => {
                            self.ctx.release().await;
                            return None;
                        }
                        Some(Ok(source)) => {
                            self.phase = Phase::Streaming {
                                reader: BoxReader::with_max_payload(source, self.ctx.max_box_size),
                                assembler: FragmentAssembler::new(),
                            };
                        }
                        Some(Err(e)) => {
                            warn!(
                                "Recording stream {} of {} got no transcoder output: {}",
                                self.ctx.stream_id, self.ctx.camera, e
                            );
                            self.ctx.release().await;
                            return Some((Err(RecordingError::Transport(e)), self));
                        }
                    }
                }
                Phase::Streaming {
                    mut reader,
                    mut assembler,
                } => {
                    let next = tokio::select! {
                        biased;
                        _ = self.ctx.cancel.cancelled() => None,
                        next = reader.next_box() => Some(next),
                    };

                    match next {
                        None => {
                            debug!(
                                "Recording stream {} of {} cancelled",
                                self.ctx.stream_id, self.ctx.camera
                            );
                            self.ctx.release().await;
                            return None;
                        }
                        Some(Ok(mp4_box)) => {
                            let fragment = assembler.push(mp4_box);
                            self.phase = Phase::Streaming { reader, assembler };

                            if let Some(fragment) = fragment {
                                if self.ctx.cancel.is_cancelled() {
                                    continue;
                                }
                                return Some((Ok(fragment.into()), self));
                            }
                        }
                        Some(Err(e)) if e.is_truncation() => {
                            info!(
                                "Recording stream {} of {} ended after {} media fragments",
                                self.ctx.stream_id,
                                self.ctx.camera,
                                assembler.media_fragments()
                            );
                            self.ctx.release().await;

                            if self.ctx.closed_externally.load(Ordering::SeqCst)
                                || self.ctx.cancel.is_cancelled()
                            {
                                return None;
                            }
                            return Some((Ok(RecordingPacket::terminal()), self));
                        }
                        Some(Err(e)) => {
                            error!(
                                "Recording stream {} of {} failed: {}",
                                self.ctx.stream_id, self.ctx.camera, e
                            );
                            self.ctx.release().await;
                            return Some((Err(RecordingError::BoxStream(e)), self));
                        }
                    }
                }
            }
        }
    }
}

/// Releases the session if the consumer drops the stream early.
struct SessionGuard {
    stream_id: StreamId,
    session_id: u64,
    sessions: Arc<SessionTable>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.sessions.holds(self.stream_id, self.session_id) {
            return;
        }

        let sessions = Arc::clone(&self.sessions);
        let (stream_id, session_id) = (self.stream_id, self.session_id);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                sessions.release(stream_id, session_id).await;
            });
        }
    }
}

/// Fragments of one recording session, produced on demand
///
/// Yields the initialization segment first, then one packet per media unit.
/// Production suspends while the transcoder has nothing new and stops at the
/// next suspension point once the session is closed.
pub struct RecordingStream {
    stream_id: StreamId,
    inner: Pin<Box<dyn Stream<Item = RecordingResult<RecordingPacket>> + Send>>,
    _guard: SessionGuard,
}

impl RecordingStream {
    pub(crate) fn new(ctx: SessionContext, endpoint: OutputEndpoint) -> Self {
        let guard = SessionGuard {
            stream_id: ctx.stream_id,
            session_id: ctx.session_id,
            sessions: Arc::clone(&ctx.sessions),
        };
        let stream_id = ctx.stream_id;
        let producer = Producer {
            phase: Phase::Connecting(endpoint),
            ctx,
        };

        Self {
            stream_id,
            inner: Box::pin(stream::unfold(producer, Producer::next_item)),
            _guard: guard,
        }
    }

    /// Stream id this producer belongs to.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }
}

impl Stream for RecordingStream {
    type Item = RecordingResult<RecordingPacket>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
