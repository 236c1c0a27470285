// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use crate::common::*;
use w77q_regs::config::{AwdtThreshold, Awdtcfg};
use w77q_sec::{DeviceError, QlibError, SessionAccess, Target, WatchdogStatus};

fn enabled(threshold: AwdtThreshold) -> Awdtcfg {
    let mut cfg = Awdtcfg::new(threshold);
    cfg.enable = true;
    cfg
}

fn secs(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

#[test]
fn touch_restarts_the_count() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    q.watchdog_configure(&enabled(AwdtThreshold::Sec2)).unwrap();
    assert_eq!(q.bus().awdt(), &enabled(AwdtThreshold::Sec2));

    q.bus_mut().advance(secs(1500));
    q.watchdog_touch().unwrap();
    q.bus_mut().advance(secs(1500));
    assert_eq!(
        q.watchdog_get().unwrap(),
        WatchdogStatus {
            elapsed_ms: 1500,
            expired: false
        }
    );

    q.bus_mut().advance(secs(600));
    assert!(q.watchdog_get().unwrap().expired);
}

#[test]
fn trigger_resets_the_part() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    register_keys(&mut q, 0);
    let mut cfg = enabled(AwdtThreshold::Min1);
    cfg.sw_reset_en = true;
    q.watchdog_configure(&cfg).unwrap();
    q.open_session(0, SessionAccess::Restricted).unwrap();
    let dmc = q.bus().mc()[1];

    q.watchdog_trigger().unwrap();
    assert!(q.context().reset_status.watchdog);
    assert!(!q.context().reset_status.power_on);
    assert!(!q.context().key_mngr().is_session_open());
    assert_eq!(q.bus().session_kid(), None);
    assert_eq!(q.bus().mc(), [0, dmc + 1]);

    // the host resynchronises on the next session
    q.open_session(0, SessionAccess::Restricted).unwrap();
    assert_eq!(q.context().die().mc, q.bus().mc());
}

#[test]
fn expiry_without_reset_only_flags() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    q.watchdog_configure(&enabled(AwdtThreshold::Sec1)).unwrap();
    q.watchdog_trigger().unwrap();
    assert!(!q.context().reset_status.watchdog);
    assert!(q.watchdog_get().unwrap().expired);

    q.watchdog_touch().unwrap();
    assert!(!q.watchdog_get().unwrap().expired);
}

#[test]
fn authenticated_watchdog_needs_its_section() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    register_keys(&mut q, 3);
    let mut cfg = enabled(AwdtThreshold::Sec32);
    cfg.authenticated = true;
    cfg.kid = 3.into();
    q.watchdog_configure(&cfg).unwrap();
    assert!(q.context().watchdog_secure);

    assert!(matches!(
        q.watchdog_touch(),
        Err(QlibError::Device(DeviceError::Session))
    ));

    q.open_session(3, SessionAccess::Restricted).unwrap();
    q.bus_mut().advance(secs(10_000));
    q.watchdog_touch().unwrap();
    assert_eq!(q.watchdog_get().unwrap().elapsed_ms, 0);

    // changing the configuration takes the full key
    let plain = Awdtcfg::new(AwdtThreshold::Sec16);
    assert!(matches!(
        q.watchdog_configure(&plain),
        Err(QlibError::Device(DeviceError::Privilege))
    ));
    q.close_session(3).unwrap();
    q.open_session(3, SessionAccess::Full).unwrap();
    q.watchdog_configure(&plain).unwrap();
    assert!(!q.context().watchdog_secure);
    q.close_session(3).unwrap();
    q.watchdog_touch().unwrap();
}

#[test]
fn locked_configuration_is_final() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    let mut cfg = enabled(AwdtThreshold::Min2);
    cfg.lock = true;
    q.watchdog_configure(&cfg).unwrap();
    assert!(matches!(
        q.watchdog_configure(&enabled(AwdtThreshold::Min4)),
        Err(QlibError::IncorrectState)
    ));
}

#[test]
fn fallback_rules_depend_on_the_part() {
    let mut cfg = enabled(AwdtThreshold::Min1);
    cfg.fallback_en = true;

    let mut q = attach(sim_with_keys(Target::W77q64jwRevA));
    assert!(matches!(
        q.watchdog_configure(&cfg),
        Err(QlibError::NotSupported(_))
    ));

    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    assert!(matches!(
        q.watchdog_configure(&cfg),
        Err(QlibError::InvalidParameter(_))
    ));
    cfg.sw_reset_en = true;
    q.watchdog_configure(&cfg).unwrap();
}
