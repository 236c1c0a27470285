// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::common::*;
use w77q_regs::config::{Scr, Sspr};
use w77q_sec::{DeviceError, PaRevokeType, QlibError, SessionAccess, Target};

const OPEN: Sspr = Sspr {
    auth_cfg: false,
    integrity_ac: false,
    wp_en: false,
    rollback_en: false,
    pa_rd_en: true,
    pa_wr_en: true,
    auth_pa: false,
    auth_ac: false,
    slog: false,
};

const GATED: Sspr = Sspr {
    auth_pa: true,
    ..OPEN
};

fn scr_with(policy: Sspr) -> Scr {
    Scr {
        sspr: policy.to_u32().unwrap(),
        version: 1,
        ..Default::default()
    }
}

fn is_privilege(r: w77q_sec::Result<()>) -> bool {
    matches!(r, Err(QlibError::Device(DeviceError::Privilege)))
}

#[test]
fn open_policy_allows_plain_access() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    sim.set_policy(5, OPEN);
    let base = section_base(5);
    sim.flash_mut()[base..base + 4].copy_from_slice(&[1, 2, 3, 4]);
    let mut q = attach(sim);

    let mut buf = [0u8; 4];
    q.plain_read(5, 0, &mut buf).unwrap();
    assert_eq!(buf, [1, 2, 3, 4]);

    q.plain_write(5, 0x1f0, &[0xaa; 0x20]).unwrap();
    let mut back = [0u8; 0x20];
    q.plain_read(5, 0x1f0, &mut back).unwrap();
    assert_eq!(back, [0xaa; 0x20]);

    q.plain_erase_sector(5, 0).unwrap();
    assert!(q.bus().flash()[base..base + 0x1000].iter().all(|&b| b == 0xff));
}

#[test]
fn closed_policy_fails_before_the_bus() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    let before = q.bus().transactions();
    let mut buf = [0u8; 8];
    assert!(is_privilege(q.plain_read(6, 0, &mut buf)));
    assert!(is_privilege(q.plain_write(6, 0, &buf)));
    assert!(is_privilege(q.plain_erase_sector(6, 0)));
    assert!(is_privilege(q.erase_section(6, false)));
    assert_eq!(q.bus().transactions(), before);
}

#[test]
fn grant_and_revoke_with_pa_grant() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    sim.set_policy(6, GATED);
    let mut q = attach(sim);
    let mut buf = [0u8; 8];
    assert!(is_privilege(q.plain_read(6, 0, &mut buf)));

    q.register_key(6, key(RESTRICTED_HEX), false).unwrap();
    q.grant_plain_access(6).unwrap();
    assert_eq!(q.bus().plain_granted(6), (true, true));
    assert!(!q.context().key_mngr().is_session_open());
    q.plain_read(6, 0, &mut buf).unwrap();
    q.plain_write(6, 0, &[0x12, 0x34]).unwrap();
    assert_eq!(&q.bus().flash()[section_base(6)..section_base(6) + 2], &[0x12, 0x34]);

    q.revoke_plain_access(6, PaRevokeType::Write).unwrap();
    assert_eq!(q.bus().plain_granted(6), (true, false));
    q.plain_read(6, 0, &mut buf).unwrap();
    assert!(is_privilege(q.plain_write(6, 0, &buf)));

    q.revoke_plain_access(6, PaRevokeType::All).unwrap();
    assert_eq!(q.bus().plain_granted(6), (false, false));
    assert!(is_privilege(q.plain_read(6, 0, &mut buf)));
}

#[test]
fn grant_without_a_key_is_refused() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    sim.set_policy(6, GATED);
    let mut q = attach(sim);
    assert!(is_privilege(q.grant_plain_access(6)));
}

#[test]
fn grant_through_a_session_cycle() {
    let mut sim = sim_with_keys(Target::W77q128jvRevA);
    sim.set_policy(1, GATED);
    let mut q = attach(sim);
    register_keys(&mut q, 1);
    register_keys(&mut q, 3);

    // a session on another section survives the grant
    q.open_session(3, SessionAccess::Full).unwrap();
    q.grant_plain_access(1).unwrap();
    assert_eq!(q.bus().plain_granted(1), (true, true));
    assert_eq!(q.context().key_mngr().kid(), w77q_sec::Kid::full(3));

    let mut buf = [0u8; 16];
    q.plain_read(1, 0, &mut buf).unwrap();

    assert!(matches!(
        q.revoke_plain_access(1, PaRevokeType::Write),
        Err(QlibError::NotSupported(_))
    ));
    q.revoke_plain_access(1, PaRevokeType::All).unwrap();
    assert_eq!(q.bus().plain_granted(1), (false, false));
    assert!(is_privilege(q.plain_read(1, 0, &mut buf)));
}

#[test]
fn session_opens_plain_access() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    sim.set_policy(2, GATED);
    let mut q = attach(sim);
    register_keys(&mut q, 2);
    q.open_session(2, SessionAccess::Restricted).unwrap();
    let mut buf = [0u8; 16];
    q.plain_read(2, 0, &mut buf).unwrap();
}

#[test]
fn access_locks_hold_until_reset() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    sim.set_policy(2, OPEN);
    let mut q = attach(sim);
    let mut buf = [0u8; 16];
    q.plain_read(2, 0, &mut buf).unwrap();

    q.config_access(2, false, true).unwrap();
    assert!(is_privilege(q.plain_read(2, 0, &mut buf)));
    q.plain_write(2, 0, &[0]).unwrap();

    // clearing a lock bit does not unlock it
    q.config_access(2, true, true).unwrap();
    assert_eq!(q.get_aclr().unwrap().rd_lock, 1 << 2);

    q.bus_mut().power_cycle();
    q.sync_state().unwrap();
    assert!(q.context().reset_status.power_on);
    q.plain_read(2, 0, &mut buf).unwrap();
    assert_eq!(q.get_aclr().unwrap().rd_lock, 0);
}

#[test]
fn plain_section_erase() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    sim.set_policy(7, OPEN);
    let base = section_base(7);
    sim.flash_mut()[base..base + 0x1_0000].fill(0);
    let mut q = attach(sim);

    q.erase_section(7, false).unwrap();
    assert!(q.bus().flash()[base..base + 0x1_0000].iter().all(|&b| b == 0xff));
}

#[test]
fn reloaded_policy_governs_plain_access() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    sim.set_policy(5, OPEN);
    let mut q = attach(sim);
    register_keys(&mut q, 5);

    q.open_session(5, SessionAccess::Full).unwrap();
    q.set_scr(5, &scr_with(Sspr::default()), false, true).unwrap();
    // reload keeps the session
    assert!(q.context().key_mngr().is_section_full_access(5));
    q.close_session(5).unwrap();

    let before = q.bus().transactions();
    let mut buf = [0u8; 8];
    assert!(is_privilege(q.plain_read(5, 0, &mut buf)));
    assert!(is_privilege(q.plain_write(5, 0, &buf)));
    assert!(is_privilege(q.plain_erase_sector(5, 0)));
    assert_eq!(q.bus().transactions(), before);

    q.open_session(5, SessionAccess::Full).unwrap();
    q.set_scr(5, &scr_with(OPEN), false, true).unwrap();
    q.close_session(5).unwrap();
    q.plain_write(5, 0, &[0x42]).unwrap();
    q.plain_read(5, 0, &mut buf).unwrap();
    assert_eq!(buf[0], 0x42);
}

#[test]
fn scr_without_reload_drops_session_and_plain_access() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    sim.set_policy(4, OPEN);
    let mut q = attach(sim);
    register_keys(&mut q, 4);
    q.open_session(4, SessionAccess::Full).unwrap();

    let read_only = Sspr {
        pa_wr_en: false,
        ..OPEN
    };
    q.set_scr(4, &scr_with(read_only), false, false).unwrap();
    assert!(!q.context().key_mngr().is_session_open());
    assert_eq!(q.bus().session_kid(), None);
    let s = q.context().die().section(4).unwrap();
    assert_eq!(s.policy, Some(read_only));
    assert!(!s.plain_rd && !s.plain_wr);

    let mut buf = [0u8; 8];
    assert!(is_privilege(q.plain_read(4, 0, &mut buf)));

    q.grant_plain_access(4).unwrap();
    q.plain_read(4, 0, &mut buf).unwrap();
    assert!(is_privilege(q.plain_write(4, 0, &buf)));
}
