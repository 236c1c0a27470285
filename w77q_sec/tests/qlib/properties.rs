// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::common::*;
use w77q_sec::context::{DMC, TC};
use w77q_sec::{DeviceError, QlibError, SessionAccess, Target};

#[test]
fn host_counter_follows_device() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    sim.set_mc(0x40, 3);
    let mut q = attach(sim);
    register_keys(&mut q, 0);

    q.open_session(0, SessionAccess::Full).unwrap();
    for _ in 0..5 {
        q.get_wid_signed().unwrap();
    }
    let mut buf = [0u8; 96];
    q.read(0, 0, &mut buf, false).unwrap();
    q.write(0, 0x100, &[0x5a; 40]).unwrap();

    assert!(q.context().die().mc_in_sync);
    assert_eq!(q.context().die().mc, q.bus().mc());
    assert_eq!(q.bus().mc()[1], 3);
}

#[test]
fn signed_read_needs_a_session() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    let before = q.bus().transactions();
    let err = q.get_gmt_signed().unwrap_err();
    assert!(matches!(err, QlibError::Device(DeviceError::Session)));
    assert_eq!(q.bus().transactions(), before);
}

#[test]
fn host_checks_precede_bus_traffic() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    register_keys(&mut q, 1);
    let before = q.bus().transactions();

    let mut buf = [0u8; 16];
    assert!(matches!(
        q.read(1, 0, &mut buf, false),
        Err(QlibError::Device(DeviceError::Session))
    ));
    assert!(matches!(
        q.erase(1, 0x10, 0x1000),
        Err(QlibError::InvalidParameter(_))
    ));
    assert!(matches!(
        q.secure_log_write(1, &[0; 17], false),
        Err(QlibError::InvalidParameter(_))
    ));
    assert!(matches!(
        q.open_session(12, SessionAccess::Full),
        Err(QlibError::InvalidParameter(_))
    ));
    assert_eq!(q.bus().transactions(), before);
}

#[test]
fn reads_past_the_section_are_rejected() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    register_keys(&mut q, 0);
    q.open_session(0, SessionAccess::Restricted).unwrap();
    let before = q.bus().transactions();
    let mut buf = [0u8; 64];
    let err = q.read(0, 0xffe0, &mut buf, false).unwrap_err();
    assert!(matches!(err, QlibError::OutOfRange(_)));
    assert_eq!(q.bus().transactions(), before);
}

#[test]
fn wid_is_bound_into_sessions() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    sim.set_wid(0xfeed_0000_0000_beef);
    let mut q = attach(sim);
    assert_eq!(q.get_wid(), 0xfeed_0000_0000_beef);

    register_keys(&mut q, 2);
    q.open_session(2, SessionAccess::Restricted).unwrap();
    assert_eq!(q.get_wid_signed().unwrap(), 0xfeed_0000_0000_beef);
}

#[test]
fn device_randomness_is_authenticated() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    register_keys(&mut q, 0);
    q.open_session(0, SessionAccess::Restricted).unwrap();
    let a = q.get_rngr().unwrap();
    let b = q.get_rngr().unwrap();
    assert_ne!(a, b);

    q.bus_mut().corrupt_next_signature();
    assert!(matches!(q.get_rngr(), Err(QlibError::SignatureMismatch)));
}

#[test]
fn cdi_depends_on_section_contents() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    register_keys(&mut q, 3);
    q.open_session(3, SessionAccess::Full).unwrap();
    let first = q.calc_cdi(0).unwrap();
    assert_eq!(q.calc_cdi(0).unwrap(), first);

    q.write(3, 0, b"new firmware image").unwrap();
    assert_ne!(q.calc_cdi(0).unwrap(), first);
}

#[test]
fn counter_is_reread_after_session_close() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    register_keys(&mut q, 0);
    q.open_session(0, SessionAccess::Restricted).unwrap();
    q.close_session(0).unwrap();

    // another host consumed counters behind our back
    let [tc, dmc] = q.bus().mc();
    q.bus_mut().set_mc(tc + 9, dmc);
    q.open_session(0, SessionAccess::Restricted).unwrap();
    assert_eq!(q.context().die().mc[TC], q.bus().mc()[TC]);
}

#[test]
fn device_counter_must_not_go_back() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    sim.set_mc(0x40, 10);
    let mut q = attach(sim);
    register_keys(&mut q, 0);
    q.open_session(0, SessionAccess::Restricted).unwrap();
    q.close_session(0).unwrap();
    let cached = q.context().die().mc;
    assert_eq!(cached[DMC], 10);

    let [tc, _] = q.bus().mc();
    q.bus_mut().set_mc(tc + 1, 5);
    let err = q.synch_mc().unwrap_err();
    assert!(matches!(err, QlibError::Device(DeviceError::MonotonicCounter)));
    assert_eq!(q.context().die().mc, cached);
    assert!(!q.context().die().mc_in_sync);

    // nor can a session be bound to the lower value
    assert!(matches!(
        q.open_session(0, SessionAccess::Restricted),
        Err(QlibError::Device(DeviceError::MonotonicCounter))
    ));
}

#[test]
fn signed_counter_read_never_trails_the_sync() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    sim.set_mc(0x100, 7);
    let mut q = attach(sim);
    register_keys(&mut q, 1);
    q.open_session(1, SessionAccess::Full).unwrap();

    q.synch_mc().unwrap();
    let synced = q.context().die().mc;
    let signed = q.get_mc_signed().unwrap();
    assert!(signed[TC] >= synced[TC]);
    assert!(signed[DMC] >= synced[DMC]);
    assert_eq!(signed, [synced[TC], synced[DMC]]);

    let again = q.get_mc_signed().unwrap();
    assert!(again[TC] > signed[TC]);
    assert_eq!(again[DMC], signed[DMC]);
}
