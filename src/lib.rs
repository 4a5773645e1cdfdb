//! Fault-injection driven firmware extraction for Renesas RH850 parts whose
//! serial boot ROM has ID-code protection enabled.
//!
//! The pieces, leaves first:
//!
//! - [`packet`]: the SOH/SOD framed packets spoken by the boot ROM once it is
//!   in command mode.
//! - [`boot`]: the negotiation sequence (reset echo, baud sync, device type,
//!   frequency, bitrate) and the final check that tells us whether the glitch
//!   got us past the protection.
//! - [`trigger`]: reset line handling and the pulse generator.
//! - [`layout`]: carving the target's flash into blocks to read.
//! - [`reader`]: the chunked read protocol and the image file.
//! - [`sweep`]: the top-level loop over glitch parameters.

use std::{borrow::Cow, fmt, time::Duration};

use thiserror::Error;

pub mod boot;
pub mod layout;
pub mod link;
pub mod packet;
pub mod profile;
pub mod reader;
pub mod sweep;
pub mod trigger;

pub use boot::{BootDeviceInfo, BootSession, Cmd, Handshake};
pub use layout::{Layout, MemoryBlock, Region};
pub use link::Link;
pub use packet::Packet;
pub use profile::TargetProfile;
pub use reader::{FlashImage, FlashReader};
pub use sweep::{GlitchParameters, Sweep, SweepEnd, SweepPlan, SweepRange};
pub use trigger::GlitchTrigger;

/// Timing knobs shared by the trigger, handshake and reader.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Timing {
    /// Read timeout on the control channel; bounds every single read.
    pub read_timeout: Duration,
    /// Wait after releasing reset, before talking to the boot ROM.
    pub settle: Duration,
    /// Wait after asserting reset again, before the next attempt.
    pub cooldown: Duration,
    /// Pause between re-reads while a chunk is still trickling in.
    pub chunk_backoff: Duration,
    /// Number of reads that may come back empty before a chunk is abandoned.
    pub chunk_rereads: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            read_timeout: Duration::from_millis(100),
            settle: Duration::from_millis(100),
            cooldown: Duration::from_millis(200),
            chunk_backoff: Duration::from_millis(50),
            chunk_rereads: 100,
        }
    }
}

impl Timing {
    /// No waiting at all. Useful against simulated links.
    pub fn immediate() -> Self {
        Timing {
            read_timeout: Duration::ZERO,
            settle: Duration::ZERO,
            cooldown: Duration::ZERO,
            chunk_backoff: Duration::ZERO,
            chunk_rereads: 8,
        }
    }
}

/// The handshake exchange a failure happened in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Stage {
    ResetEcho,
    Sync,
    DeviceType,
    FrequencySet,
    BitrateSet,
    GlitchCheck,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::ResetEcho => "reset echo",
            Stage::Sync => "sync",
            Stage::DeviceType => "device type",
            Stage::FrequencySet => "frequency set",
            Stage::BitrateSet => "bitrate set",
            Stage::GlitchCheck => "glitch check",
        })
    }
}

/// Why a handshake exchange failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Failure {
    /// The boot ROM answered cleanly that serial programmer connection is
    /// prohibited. The glitch didn't take, but the link is fine.
    ProtectionHeld,
    /// Anything else, including nothing at all.
    Unexpected(Vec<u8>),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::ProtectionHeld => f.write_str("serial programmer connection prohibited"),
            Failure::Unexpected(bytes) => write!(f, "unexpected response {bytes:02x?}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("packet checksum mismatch: frame carries {expected:#04x}, computed {actual:#04x}")]
    Checksum {
        expected: u8,
        actual: u8,
    },
    #[error("malformed frame ({reason}): {bytes:02x?}")]
    Framing {
        reason: &'static str,
        bytes: Vec<u8>,
    },
    #[error("handshake failed at {stage}: {cause}")]
    HandshakeFailed {
        stage: Stage,
        cause: Failure,
    },
    #[error("control channel dropped, reset echo returned {observed:02x?}")]
    ControlChannelDropped {
        observed: Vec<u8>,
    },
    #[error("reading block {block} failed")]
    BlockReadFailed {
        block: MemoryBlock,
        #[source]
        cause: Box<Self>,
    },
    #[error("timed out waiting for {wanted} bytes, got {got:02x?}")]
    Timeout {
        wanted: usize,
        got: Vec<u8>,
    },
    #[error("device sent {0}")]
    Protocol(Cow<'static, str>),
    #[error("bad target profile: {0}")]
    Profile(Cow<'static, str>),
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("serial port configuration error")]
    Ser(#[from] serialport::Error),
    #[error("pulse generator write failed")]
    Pulse(#[source] std::io::Error),

    #[error("{0}")]
    Context(Cow<'static, str>, #[source] Box<Self>),
}

impl Error {
    /// Strips any context wrappers to get at the error that actually
    /// happened.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context(_, inner) => inner.root(),
            e => e,
        }
    }

    /// Whether the control channel itself failed, as opposed to the device
    /// saying something we didn't like.
    pub fn is_channel_failure(&self) -> bool {
        matches!(
            self.root(),
            Error::ControlChannelDropped { .. } | Error::Io(_) | Error::Ser(_)
        )
    }

    pub fn is_protection_held(&self) -> bool {
        matches!(
            self.root(),
            Error::HandshakeFailed { cause: Failure::ProtectionHeld, .. }
        )
    }
}

pub trait OurContext {
    type Ok;
    fn context(self, info: impl Into<Cow<'static, str>>) -> Result<Self::Ok, Error>;
    fn with_context<M>(self, f: impl FnOnce() -> M) -> Result<Self::Ok, Error>
        where M: Into<Cow<'static, str>>;
}

impl<T, E> OurContext for Result<T, E>
    where E: Into<Error>,
{
    type Ok = T;

    fn context(self, info: impl Into<Cow<'static, str>>) -> Result<T, Error> {
        self.map_err(|e| Error::Context(info.into(), Box::new(e.into())))
    }

    fn with_context<M>(self, f: impl FnOnce() -> M) -> Result<T, Error>
        where M: Into<Cow<'static, str>>
    {
        self.map_err(|e| Error::Context(f().into(), Box::new(e.into())))
    }
}

pub(crate) fn context_scope<T, C>(
    body: impl FnOnce() -> Result<T, Error>,
    context_provider: impl FnOnce() -> C,
) -> Result<T, Error>
    where C: Into<Cow<'static, str>>,
{
    body().with_context(context_provider)
}
