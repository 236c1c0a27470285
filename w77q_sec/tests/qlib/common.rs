// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use w77q_sec::sim::SimDevice;
use w77q_sec::{Key, Kid, Qlib, QlibConfig, Target};

pub type SimQlib = Qlib<'static, SimDevice>;

pub const MASTER_HEX: &str = "000102030405060708090a0b0c0d0e0f";
pub const FULL_HEX: &str = "f0e1d2c3b4a5968778695a4b3c2d1e0f";
pub const RESTRICTED_HEX: &str = "11223344556677889900aabbccddeeff";

/// Parse a 16 byte key and give it the lifetime the key manager wants.
pub fn key(hex_str: &str) -> &'static Key {
    let bytes = hex::decode(hex_str).unwrap();
    let key: Key = bytes.try_into().unwrap();
    Box::leak(Box::new(key))
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic nonces: a 64 bit LCG.
pub fn entropy() -> Box<dyn w77q_sec::EntropySource> {
    let mut state = 0x853c_49e6_748f_ea9bu64;
    Box::new(move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        state
    })
}

/// A part with the device master key and the test section keys on
/// every main section.
pub fn sim_with_keys(target: Target) -> SimDevice {
    let mut sim = SimDevice::new(target);
    sim.set_master_key(*key(MASTER_HEX));
    for s in 0..w77q_regs::NUM_MAIN_SECTIONS as u8 {
        sim.set_key(Kid::full(s), *key(FULL_HEX));
        sim.set_key(Kid::restricted(s), *key(RESTRICTED_HEX));
    }
    sim
}

pub fn attach(sim: SimDevice) -> SimQlib {
    attach_with(sim, QlibConfig::default())
}

/// Connect, detect the part from HW_VER and sync the cached state.
pub fn attach_with(sim: SimDevice, config: QlibConfig) -> SimQlib {
    init_logging();
    let mut q = Qlib::new(sim, entropy(), config);
    q.connect().unwrap();
    q.cfg_init(None).unwrap();
    q.sync_state().unwrap();
    q
}

/// Register both test keys for `section`.
pub fn register_keys(q: &mut SimQlib, section: u8) {
    q.register_key(section, key(FULL_HEX), true).unwrap();
    q.register_key(section, key(RESTRICTED_HEX), false).unwrap();
}

pub fn section_base(section: u8) -> usize {
    usize::from(section) * w77q_regs::KB_64 as usize
}
