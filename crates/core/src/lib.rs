//! Real-time media producer for a playout channel
//!
//! This crate turns a media container (local file or network URL) into a
//! continuous sequence of time-aligned frames at a fixed target format:
//! the demuxer, per-stream decoders and two filter graphs run on their own
//! threads with bounded queues, while the consumer pulls one conformant
//! frame per channel tick.
//!
//! # Example
//!
//! ```ignore
//! use playout_core::{ChannelFormat, MediaProducer, ProducerOptions};
//!
//! let producer = MediaProducer::new(
//!     ChannelFormat::hd1080i50(),
//!     ProducerOptions::from_url("clip.mov").with_looping(true),
//! )?;
//!
//! loop {
//!     let frame = producer.next_frame();
//!     if frame.is_late() {
//!         // underflow: repeat the previous image this tick
//!     }
//!     // hand `frame` to the compositor
//! }
//! # Ok::<(), playout_core::Error>(())
//! ```

#![warn(missing_docs)]

pub mod commands;
pub mod error;
pub mod format;
pub mod producer;

pub use error::{Error, Result};
pub use format::{audio_cadence, ChannelFormat, FieldOrder, Rational};
pub use producer::{
    DrawFrame, MediaKind, MediaProducer, OutputFrame, Plane, ProducerOptions, StreamDetails,
    StreamInfo, VideoImage,
};
