// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host side driver for the W77Q family of secure SPI flash parts.
//!
//! [`Qlib`] owns the bus adapter, the hash engine and the per-die state.
//! The methods defined in `cmd_proc` and `cmd_data` map one to one onto
//! secure commands; the ones in `sec` combine them into the operations an
//! application actually wants (open a session, read a section, touch the
//! watchdog).

pub mod cfg;
pub mod cmd;
pub mod cmd_data;
pub mod cmd_proc;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod key_mngr;
pub mod prng;
pub mod sec;
pub mod sim;
pub mod tm;

pub use cfg::{Capabilities, Feature, Features, Target};
pub use cmd::{ConfigAction, EraseType, IntegrityType, Kid, PaRevokeType, SessionAccess};
pub use cmd_proc::Qlib;
pub use config::QlibConfig;
pub use crypto::{HashEngine, Key, Sha256Engine};
pub use error::{BusError, DeviceError, QlibError, Result};
pub use prng::EntropySource;
pub use sec::{DeviceConfig, Notifications, SectionConfig, SectionInfo, WatchdogStatus};
pub use tm::{Bus, Transaction};
