//! Native Rust client for the GameStream/Moonlight streaming protocol as
//! spoken by Sunshine and NVIDIA GameStream hosts.
//!
//! The crate covers the full client side of one streaming session: the
//! paired-identity handshake, the RTSP setup exchange, the encrypted control
//! channel, the video pipeline (RTP reassembly, Reed-Solomon recovery, IDR
//! gating), the audio pipeline, and input packet assembly. The embedding
//! application supplies the decoder, audio and listener surfaces and receives
//! raw media units -- no decoding or rendering happens here.
//!
//! Typical flow:
//!
//! 1. [`identity::ClientIdentity::load_or_generate`] for the long-term
//!    identity.
//! 2. [`network::MoonlightHost`] for `/serverinfo`, pairing transport and
//!    `/launch`.
//! 3. [`pair::PairingEngine`] once per host.
//! 4. [`stream::start_stream`] per session.

pub mod audio;
pub mod control;
pub mod crypto;
pub mod error;
pub mod fec;
pub mod identity;
pub mod input;
pub mod network;
pub mod pair;
pub mod protocol;
pub mod rtsp;
pub mod stream;
pub mod types;
pub mod video;

pub use error::{MoonlightError, Result};
pub use stream::{start_stream, MoonlightStream};
pub use types::{
    AudioConfiguration, AudioRenderer, ConnectionListener, ConnectionStatus, DecodeUnit,
    FrameType, ServerInformation, Stage, StreamConfiguration, SupportedVideoFormats,
    VideoDecoder, VideoFormat,
};
