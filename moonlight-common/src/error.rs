//! Error taxonomy for the protocol client.

use crate::types::Stage;

/// Termination codes echoed to listeners. These match the wider Moonlight
/// ecosystem so downstream UIs can interpret them uniformly.
pub const ERR_GRACEFUL_TERMINATION: i32 = 0;
pub const ERR_NO_VIDEO_TRAFFIC: i32 = -100;
pub const ERR_NO_VIDEO_FRAME: i32 = -101;
pub const ERR_UNEXPECTED_TERMINATION: i32 = -102;
pub const ERR_PROTECTED_CONTENT: i32 = -103;
pub const ERR_FRAME_CONVERSION: i32 = -104;
pub const ERR_UNSUPPORTED: i32 = -5501;

#[derive(Debug, thiserror::Error)]
pub enum MoonlightError {
    #[error("invalid AES key size")]
    InvalidKey,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,

    #[error("pairing failed during {phase}: {reason}")]
    PairingFailed { phase: PairPhase, reason: String },

    #[error("API request failed: {0}")]
    Api(String),
    #[error("host returned status {0}")]
    ApiStatus(u16),

    #[error("RTSP {method} failed: {status} {reason}")]
    RtspStatus {
        method: &'static str,
        status: u16,
        reason: String,
    },
    #[error("malformed RTSP response: {0}")]
    RtspMalformed(String),
    #[error("RTSP response missing Session header")]
    RtspNoSession,

    #[error("control stream not connected")]
    ControlNotConnected,
    #[error("control packet replayed or reordered (seq {got} <= {last})")]
    ControlReplay { got: u32, last: u32 },
    #[error("input on control stream not supported by this host generation")]
    InputUnsupported,

    #[error("no video traffic received from host")]
    NoVideoTraffic,
    #[error("packet too small")]
    PacketTooSmall,

    #[error("too many shards")]
    FecTooManyShards,
    #[error("not enough shards for reconstruction")]
    FecNotEnoughShards,
    #[error("invalid shard size")]
    FecInvalidShardSize,
    #[error("singular matrix")]
    FecSingularMatrix,

    #[error("input stream not initialized")]
    InputNotInitialized,
    #[error("feature not supported by this host")]
    Unsupported,
    #[error("invalid parameter")]
    InvalidParameter,

    #[error("connection stage {0} failed")]
    StageFailed(Stage),
    #[error("a streaming connection already exists")]
    ConnectionAlreadyExists,

    #[error("identity error: {0}")]
    Identity(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("XML parse error: {0}")]
    Xml(#[from] quick_xml::DeError),
}

/// Which of the four pairing phases produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairPhase {
    GetServerCert,
    ClientChallenge,
    ServerChallengeResponse,
    ClientPairingSecret,
}

impl std::fmt::Display for PairPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::GetServerCert => "getservercert",
            Self::ClientChallenge => "clientchallenge",
            Self::ServerChallengeResponse => "serverchallengeresp",
            Self::ClientPairingSecret => "clientpairingsecret",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, MoonlightError>;
