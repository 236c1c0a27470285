// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::common::*;
use w77q_regs::config::{Scr, Sspr};
use w77q_regs::status::Ssr;
use w77q_sec::cmd::SecCmd;
use w77q_sec::{DeviceError, QlibConfig, QlibError, SessionAccess, Target};

fn readable_scr() -> Scr {
    let policy = Sspr {
        pa_rd_en: true,
        ..Default::default()
    };
    Scr {
        sspr: policy.to_u32().unwrap(),
        version: 2,
        ..Default::default()
    }
}

#[test]
fn set_scr_retries_after_sys_err() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    register_keys(&mut q, 0);
    q.open_session(0, SessionAccess::Full).unwrap();

    q.bus_mut().fail_next(SecCmd::SetScr, Ssr::SYS_ERR);
    q.set_scr(0, &readable_scr(), false, false).unwrap();
    assert_eq!(q.bus().scr(0), Some(readable_scr()));
    assert_eq!(q.context().die().section(0).unwrap().policy, readable_scr().policy().ok());
    assert_eq!(q.context().die().mc, q.bus().mc());
}

#[test]
fn set_scr_sys_err_without_retries() {
    let mut config = QlibConfig::default();
    config.errata.set_cmd_retries = 0;
    let mut q = attach_with(sim_with_keys(Target::W77q25nwxxiRevA), config);
    register_keys(&mut q, 0);
    q.open_session(0, SessionAccess::Full).unwrap();

    q.bus_mut().fail_next(SecCmd::SetScr, Ssr::SYS_ERR);
    let err = q.set_scr(0, &readable_scr(), false, false).unwrap_err();
    assert!(matches!(err, QlibError::Device(DeviceError::System)));
    assert_eq!(q.bus().scr(0), Some(Scr::default()));
}

#[test]
fn set_scr_needs_the_full_key() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    register_keys(&mut q, 0);
    q.open_session(0, SessionAccess::Restricted).unwrap();
    assert!(matches!(
        q.set_scr(0, &readable_scr(), false, false),
        Err(QlibError::CommandIgnored)
    ));
}

#[test]
fn open_session_sys_err_is_dropped() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    register_keys(&mut q, 1);
    q.bus_mut().flag_next(SecCmd::SessionOpen, Ssr::SYS_ERR);
    q.open_session(1, SessionAccess::Full).unwrap();

    // the sticky bit is gone, so the next command is clean
    let mut buf = [0u8; 32];
    q.read(1, 0, &mut buf, true).unwrap();
}

#[test]
fn open_session_sys_err_reported_when_not_ignored() {
    let mut config = QlibConfig::default();
    config.errata.ignore_open_session_sys_err = false;
    let mut q = attach_with(sim_with_keys(Target::W77q25nwxxiRevA), config);
    register_keys(&mut q, 1);
    q.bus_mut().flag_next(SecCmd::SessionOpen, Ssr::SYS_ERR);
    let err = q.open_session(1, SessionAccess::Full).unwrap_err();
    assert!(matches!(err, QlibError::Device(DeviceError::System)));
    assert!(!q.context().key_mngr().is_session_open());
}

#[test]
fn set_scr_session_error_verified_by_readback() {
    let mut q = attach(sim_with_keys(Target::W77q64jwRevA));
    register_keys(&mut q, 2);
    q.open_session(2, SessionAccess::Full).unwrap();

    q.bus_mut().flag_next(SecCmd::SetScr, Ssr::SES_ERR);
    q.set_scr(2, &readable_scr(), false, false).unwrap();
    assert_eq!(q.bus().scr(2), Some(readable_scr()));
}

#[test]
fn set_scr_session_error_stands_if_not_applied() {
    let mut q = attach(sim_with_keys(Target::W77q64jwRevA));
    register_keys(&mut q, 2);
    q.open_session(2, SessionAccess::Full).unwrap();

    q.bus_mut().fail_next(SecCmd::SetScr, Ssr::SES_ERR);
    let err = q.set_scr(2, &readable_scr(), false, false).unwrap_err();
    assert!(matches!(err, QlibError::Device(DeviceError::Session)));
}

#[test]
fn scr_with_reset_restarts_the_part() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    register_keys(&mut q, 4);
    q.open_session(4, SessionAccess::Full).unwrap();
    let dmc = q.bus().mc()[1];
    q.set_scr(4, &readable_scr(), true, false).unwrap();
    assert_eq!(q.bus().scr(4), Some(readable_scr()));
    assert_eq!(q.bus().mc()[1], dmc + 1);
    assert_eq!(q.bus().session_kid(), None);
    assert!(!q.context().key_mngr().is_session_open());

    q.sync_state().unwrap();
    assert!(!q.context().reset_status.power_on);
    assert!(q.context().die().section(4).unwrap().plain_rd);
}

#[test]
fn reloaded_scr_reads_back() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    register_keys(&mut q, 3);
    q.open_session(3, SessionAccess::Full).unwrap();

    let scr = Scr {
        checksum: 0x1234_5678,
        digest: 0x0bad_f00d_dead_beef,
        ..readable_scr()
    };
    q.set_scr(3, &scr, false, true).unwrap();
    assert_eq!(q.get_scr_unsigned(3).unwrap(), scr);
    assert!(q.context().key_mngr().is_section_full_access(3));
    assert_eq!(q.context().die().section(3).unwrap().policy, scr.policy().ok());
}
