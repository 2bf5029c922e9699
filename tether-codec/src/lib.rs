//! # Tether Codec - Framing Handlers for Tether Pipelines
//!
//! `tether-codec` provides reusable codec [`Handler`](tether::Handler)s for
//! [`tether`] pipelines.
//!
//! ## Features
//!
//! - **LengthFieldPrepender**: outbound stage that puts a binary length field in
//!   front of every message
//! - **LengthFieldBasedFrameDecoder**: inbound stage that cuts a byte stream back
//!   into the frames a prepender wrote
//!
//! Field widths of 1, 2, 3, 4 or 8 bytes are supported, in either byte order.
//!
//! ## Building a Pipeline with Codecs
//!
//! ```rust
//! use bytes::{Bytes, BytesMut};
//! use tether::{Pipeline, PipelineBase};
//! use tether_codec::{LengthFieldBasedFrameDecoder, LengthFieldPrepender};
//!
//! let pipeline: Pipeline<BytesMut, Bytes> = Pipeline::new();
//! pipeline
//!     .add_back(LengthFieldBasedFrameDecoder::new(4, 64 * 1024)?)
//!     .add_back(LengthFieldPrepender::new(4)?);
//! // pipeline.add_back(your_handler);
//! # Ok::<(), std::io::Error>(())
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

/// Inbound length-prefixed frame decoder
pub mod length_field_based_frame_decoder;

/// Outbound length field encoder
pub mod length_field_prepender;


// Re-export commonly used types
pub use length_field_based_frame_decoder::LengthFieldBasedFrameDecoder;
pub use length_field_prepender::{LengthFieldPrepender, SUPPORTED_FIELD_LENGTHS};
