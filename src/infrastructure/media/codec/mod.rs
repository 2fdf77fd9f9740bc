//! Audio codec implementations

pub mod g711;
pub mod payload;

pub use g711::{AudioCodec, G711Type, PcmaCodec, PcmuCodec};
pub use payload::PayloadType;
