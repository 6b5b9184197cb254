//! LipoVision streaming core
//!
//! This crate streams imagery from microfluidics devices (a DropletGenomics
//! rig over HTTP, or recorded video and stills on disk) to a viewer that
//! must never render stale frames.
//!
//! # Architecture
//!
//! Freshness is enforced by construction:
//!
//! 1. **Every frame has a lifetime**: a `FrameLifetime` derived from the
//!    governing `StreamScope` of the stream that produced it.
//! 2. **Supersession retires**: frame N is retired before frame N+1 enters
//!    the queue, so at most one frame per stream is ever fresh.
//! 3. **Extraction retires**: taking the image out of a frame ends its life.
//! 4. **Cancellation retires**: cancelling the governing scope retires every
//!    outstanding frame and stops the acquisition loop.
//! 5. **Backpressure, not eviction**: a full queue blocks the producer.
//!
//! # Module Structure
//!
//! - `scope`: cancellation scopes (`StreamScope`)
//! - `frame`: frames and their lifetimes
//! - `pipe`: bounded frame queue, publisher and frame pacing
//! - `device`: the `Device` and `Controller` contracts, file and
//!   DropletGenomics devices
//! - `processor`: consumer loop dispatching fresh frames to sinks
//! - `session`: device switching and the camera/pump control path
//! - `config`: JSON file plus environment configuration

pub mod config;
pub mod device;
pub mod frame;
pub mod pipe;
pub mod processor;
pub mod scope;
pub mod session;

pub use config::{DeviceKind, ViewerConfig};
pub use device::{
    open_device, Capabilities, CommandKind, Controller, Device, DropletConfig,
    DropletGenomicsDevice, FileConfig, FileDevice,
};
pub use frame::{Frame, FrameLifetime};
pub use pipe::{frame_pipe, FramePublisher, FrameStream, Pacer, DEFAULT_QUEUE_DEPTH};
pub use processor::{FrameProcessor, ProcessorStats, Sinks, STREAM_ORIGINAL};
pub use scope::{ScopedReader, StreamScope};
pub use session::{ControlSession, StreamSession};
