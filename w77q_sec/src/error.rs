// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use thiserror::Error;
use w77q_regs::status::Ssr;

/// Sticky error indications reported by the device in the SSR.
///
/// The discriminant of each variant is the bit position of the matching SSR
/// bit, so a variant can be recovered from a bit number with `from_u32`.
#[derive(Debug, FromPrimitive, ToPrimitive, Copy, Clone, Eq, PartialEq, Error)]
pub enum DeviceError {
    #[error("device is busy")]
    Busy = 0,
    #[error("device reported an error")]
    Generic = 2,
    #[error("session error (no session, or session rejected)")]
    Session = 10,
    #[error("section integrity check failed")]
    Integrity = 12,
    #[error("command authentication failed")]
    Authentication = 13,
    #[error("command requires a privilege that is not held")]
    Privilege = 14,
    #[error("command was ignored")]
    Ignored = 15,
    #[error("device system error")]
    System = 16,
    #[error("flash array error")]
    Flash = 17,
    #[error("monotonic counter error")]
    MonotonicCounter = 19,
}

impl DeviceError {
    /// Order in which simultaneous sticky bits are reported.
    const PRIORITY: [DeviceError; 10] = [
        DeviceError::Session,
        DeviceError::Integrity,
        DeviceError::Authentication,
        DeviceError::Privilege,
        DeviceError::Ignored,
        DeviceError::System,
        DeviceError::Flash,
        DeviceError::MonotonicCounter,
        DeviceError::Generic,
        DeviceError::Busy,
    ];

    pub fn mask(self) -> u32 {
        1 << (self as u32)
    }

    pub fn from_bit(bit: u32) -> Option<DeviceError> {
        DeviceError::from_u32(bit)
    }

    /// The highest priority error among the bits of `ssr` selected by `mask`.
    pub fn from_ssr(ssr: Ssr, mask: u32) -> Option<DeviceError> {
        let bits = ssr.bits() & mask;
        Self::PRIORITY.iter().copied().find(|e| bits & e.mask() != 0)
    }
}

/// Failures of the bus transaction adapter.
#[derive(Debug, Error)]
pub enum BusError {
    /// The adapter refused a transaction it cannot express, for example a
    /// data phase larger than its buffers.
    #[error("transaction rejected by bus adapter: {0}")]
    Rejected(&'static str),

    /// The underlying link failed.
    #[error("bus I/O error")]
    Io(#[from] std::io::Error),
}

/// Status of every library operation that does not succeed.
#[derive(Debug, Error)]
pub enum QlibError {
    /// Caught before any bus activity.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("parameter out of range: {0}")]
    OutOfRange(&'static str),

    #[error("invalid data size {size:#x} (limit {limit:#x})")]
    InvalidDataSize { size: usize, limit: usize },

    /// The detected device lacks the feature the command depends on.
    #[error("not supported on this device: {0}")]
    NotSupported(&'static str),

    /// A secure command was attempted while the bus is not held.
    #[error("bus is not connected")]
    NotConnected,

    /// `connect` found the bus already locked.
    #[error("bus is locked by another user")]
    DeviceBusy,

    /// The status register read back as all ones or all zeros.
    #[error("no device responding (SSR {0:#010x})")]
    Connectivity(u32),

    /// A signature computed on the host did not match the one returned by
    /// the device. The accompanying data must not be trusted.
    #[error("authentication failure: signature mismatch")]
    SignatureMismatch,

    #[error("library or device is in the wrong state for this operation")]
    IncorrectState,

    /// The die is powered down or suspended.
    #[error("command ignored in current power state")]
    CommandIgnored,

    /// The command completed but did not have the expected effect.
    #[error("command failed verification")]
    CommandFail,

    #[error("device error")]
    Device(#[from] DeviceError),

    /// Busy polling exceeded the timeout of the command class.
    #[error("timed out waiting for device")]
    Timeout,

    #[error("no key configured for key id {kid:#04x}")]
    NoKey { kid: u8 },

    #[error("bus transaction failed")]
    Bus(#[from] BusError),

    /// A register value could not be packed or unpacked.
    // NOTE: no #[from] here; pack and unpack share one error type, so a
    // From impl could not say which of the two failed.
    #[error("register packing failed")]
    Packing(#[source] packed_struct::PackingError),

    #[error("invalid configuration")]
    Config(#[from] toml::de::Error),
}

impl QlibError {
    /// True for both host-detected and device-detected signature failures.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            QlibError::SignatureMismatch | QlibError::Device(DeviceError::Authentication)
        )
    }

    pub fn device(&self) -> Option<DeviceError> {
        match self {
            QlibError::Device(e) => Some(*e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, QlibError>;
