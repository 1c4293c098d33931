//! Groups boxes into initialization and media fragments

use bytes::{Bytes, BytesMut};
use tracing::debug;

use super::box_reader::{BoxType, Mp4Box};

/// Unit handed to the recording consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Concatenated box bytes
    pub data: Bytes,
    /// True for the ftyp+moov initialization segment
    pub is_init_segment: bool,
}

impl Fragment {
    /// Size of the fragment payload in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the fragment carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Assembler state
#[derive(Debug)]
enum AssemblerState {
    /// Collecting boxes until the movie metadata arrives
    AwaitingInit { pending: BytesMut },
    /// Pairing movie fragments with their media data
    Streaming { pending_moof: Option<Mp4Box> },
}

/// Turns a box sequence into fragments
///
/// The first fragment is always the initialization segment. After that each
/// fragment is one `moof` followed by one `mdat`. A `moof` that is not
/// followed by an `mdat` before the next `moof` is dropped.
#[derive(Debug)]
pub struct FragmentAssembler {
    state: AssemblerState,
    media_fragments: u64,
}

impl Default for FragmentAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentAssembler {
    /// Creates an assembler waiting for the initialization segment.
    pub fn new() -> Self {
        Self {
            state: AssemblerState::AwaitingInit {
                pending: BytesMut::new(),
            },
            media_fragments: 0,
        }
    }

    /// True once the initialization segment has been emitted.
    pub fn is_streaming(&self) -> bool {
        matches!(self.state, AssemblerState::Streaming { .. })
    }

    /// Number of media fragments emitted so far.
    pub fn media_fragments(&self) -> u64 {
        self.media_fragments
    }

    /// Feeds one box, returning a fragment when one completes.
    pub fn push(&mut self, mp4_box: Mp4Box) -> Option<Fragment> {
        match &mut self.state {
            AssemblerState::AwaitingInit { pending } => {
                mp4_box.write_to(pending);
                if mp4_box.box_type != BoxType::MOOV {
                    return None;
                }

                let data = std::mem::take(pending).freeze();
                self.state = AssemblerState::Streaming { pending_moof: None };
                debug!("Initialization segment complete ({} bytes)", data.len());

                Some(Fragment {
                    data,
                    is_init_segment: true,
                })
            }
            AssemblerState::Streaming { pending_moof } => match mp4_box.box_type {
                BoxType::MOOF => {
                    if let Some(dropped) = pending_moof.replace(mp4_box) {
                        debug!(
                            "Dropping unmatched moof ({} bytes) after fragment {}",
                            dropped.encoded_len(),
                            self.media_fragments
                        );
                    }
                    None
                }
                BoxType::MDAT => {
                    let Some(moof) = pending_moof.take() else {
                        debug!("Ignoring mdat without a preceding moof");
                        return None;
                    };

                    let mut data =
                        BytesMut::with_capacity(moof.encoded_len() + mp4_box.encoded_len());
                    moof.write_to(&mut data);
                    mp4_box.write_to(&mut data);
                    self.media_fragments += 1;

                    Some(Fragment {
                        data: data.freeze(),
                        is_init_segment: false,
                    })
                }
                other => {
                    debug!("Ignoring '{}' box between media fragments", other);
                    None
                }
            },
        }
    }
}
