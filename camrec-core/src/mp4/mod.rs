//! Fragmented MP4 framing
//!
//! `BoxReader` splits the transcoder's output into boxes and
//! `FragmentAssembler` regroups them into the units a recording consumer
//! plays: one initialization segment followed by `moof`+`mdat` media segments.

pub mod assembler;
pub mod box_reader;

pub use assembler::{Fragment, FragmentAssembler};
pub use box_reader::{
    BOX_HEADER_SIZE, BoxReadError, BoxReader, BoxType, DEFAULT_MAX_BOX_SIZE, Mp4Box,
    parse_box_header,
};
