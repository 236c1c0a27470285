// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::common::*;
use w77q_regs::config::{Scr, Smr, Sspr};
use w77q_regs::status::Ssr;
use w77q_regs::SECTION_VAULT;
use w77q_sec::cmd::SecCmd;
use w77q_sec::{ConfigAction, DeviceError, Kid, QlibError, SectionConfig, SessionAccess, Target};

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

const ROLLBACK: Sspr = Sspr {
    rollback_en: true,
    pa_rd_en: false,
    pa_wr_en: false,
    ..OPEN
};

fn full_session(sim: w77q_sec::sim::SimDevice, section: u8) -> SimQlib {
    let mut q = attach(sim);
    register_keys(&mut q, section);
    q.open_session(section, SessionAccess::Full).unwrap();
    q
}

fn with_policy(policy: Sspr) -> SectionConfig {
    SectionConfig {
        policy: Some(policy),
        ..Default::default()
    }
}

fn is_invalid(r: w77q_sec::Result<()>) -> bool {
    matches!(r, Err(QlibError::InvalidParameter(_)))
}

#[test]
fn config_section_writes_and_confirms() {
    let mut q = full_session(sim_with_keys(Target::W77q25nwxxiRevA), 2);
    let cfg = SectionConfig {
        policy: Some(OPEN),
        crc: Some(0x1234_5678),
        version: Some(5),
        digest: None,
    };
    q.config_section(2, &cfg, false, ConfigAction::Reload).unwrap();
    let scr = q.bus().scr(2).unwrap();
    assert_eq!((scr.version, scr.checksum, scr.digest), (5, 0x1234_5678, 0));
    assert_eq!(scr.policy().unwrap(), OPEN);
    assert!(q.context().key_mngr().is_section_full_access(2));
    let s = q.context().die().section(2).unwrap();
    assert!(s.plain_rd && s.plain_wr);

    // fields left out keep their value
    let cfg = SectionConfig {
        version: Some(6),
        ..Default::default()
    };
    q.config_section(2, &cfg, false, ConfigAction::None).unwrap();
    let scr = q.bus().scr(2).unwrap();
    assert_eq!((scr.version, scr.checksum), (6, 0x1234_5678));
    assert_eq!(scr.policy().unwrap(), OPEN);
    assert!(!q.context().key_mngr().is_session_open());
    assert_eq!(q.bus().session_kid(), None);
}

#[test]
fn erased_version_starts_over() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    sim.set_scr(
        1,
        Scr {
            version: u32::MAX,
            ..Default::default()
        },
    );
    let mut q = full_session(sim, 1);
    q.config_section(1, &with_policy(OPEN), false, ConfigAction::Reload)
        .unwrap();
    assert_eq!(q.bus().scr(1).unwrap().version, 0);
}

#[test]
fn config_section_needs_a_full_session() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    register_keys(&mut q, 2);
    let before = q.bus().transactions();
    assert!(matches!(
        q.config_section(2, &with_policy(OPEN), false, ConfigAction::Reload),
        Err(QlibError::Device(DeviceError::Session))
    ));
    assert_eq!(q.bus().transactions(), before);

    q.open_session(2, SessionAccess::Restricted).unwrap();
    assert!(matches!(
        q.config_section(2, &with_policy(OPEN), false, ConfigAction::Reload),
        Err(QlibError::Device(DeviceError::Privilege))
    ));
    q.close_session(2).unwrap();

    q.open_session(2, SessionAccess::Full).unwrap();
    assert!(matches!(
        q.config_section(3, &with_policy(OPEN), false, ConfigAction::Reload),
        Err(QlibError::Device(DeviceError::Privilege))
    ));
}

#[test]
fn bad_policies_fail_before_the_bus() {
    let mut q = full_session(sim_with_keys(Target::W77q25nwxxiRevA), 2);
    let before = q.bus().transactions();
    let log = Sspr {
        slog: true,
        ..OPEN
    };
    for bad in [
        Sspr { wp_en: true, ..log },
        Sspr {
            integrity_ac: true,
            ..log
        },
        Sspr {
            auth_cfg: true,
            ..log
        },
        Sspr { auth_ac: true, ..log },
        Sspr {
            rollback_en: true,
            ..log
        },
        // a 64KiB section is a single block
        ROLLBACK,
    ] {
        assert!(
            is_invalid(q.config_section(2, &with_policy(bad), false, ConfigAction::Reload)),
            "{bad:?}"
        );
    }
    assert_eq!(q.bus().transactions(), before);

    q.config_section(2, &with_policy(log), false, ConfigAction::Reload)
        .unwrap();
    assert!(q.bus().scr(2).unwrap().policy().unwrap().slog);
}

#[test]
fn secure_log_needs_a_supporting_part() {
    let mut q = full_session(sim_with_keys(Target::W77q128jvRevA), 2);
    let log = Sspr {
        slog: true,
        ..Default::default()
    };
    assert!(is_invalid(q.config_section(
        2,
        &with_policy(log),
        false,
        ConfigAction::Reload
    )));
}

#[test]
fn rollback_on_a_two_block_section() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    let mut gmt = q.get_gmt_unsigned().unwrap();
    gmt.set_smr(6, Smr::new(6, 1, true, 1));
    gmt.set_smr(7, Smr::new(0, 0, false, 1));
    q.configure_device(key(MASTER_HEX), None, Some(&gmt)).unwrap();
    assert_eq!(q.context().die().section(6).unwrap().size, 0x2_0000);

    register_keys(&mut q, 6);
    q.open_session(6, SessionAccess::Full).unwrap();
    q.write(6, 0, b"running").unwrap();
    q.write(6, 0x1_0000, b"updated").unwrap();

    q.config_section(6, &with_policy(ROLLBACK), true, ConfigAction::Reload)
        .unwrap();
    assert_eq!(q.bus().scr(6).unwrap().policy().unwrap(), ROLLBACK);
    let mut buf = [0u8; 7];
    q.read(6, 0, &mut buf, true).unwrap();
    assert_eq!(&buf, b"updated");
}

#[test]
fn vault_rules() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    sim.set_key(Kid::full(SECTION_VAULT), *key(FULL_HEX));
    let mut q = full_session(sim, SECTION_VAULT);
    let before = q.bus().transactions();

    let plain = Sspr {
        pa_rd_en: true,
        ..Default::default()
    };
    assert!(is_invalid(q.config_section(
        SECTION_VAULT,
        &with_policy(plain),
        false,
        ConfigAction::Reload
    )));
    // the 64KiB vault has room for one copy only
    assert!(is_invalid(q.config_section(
        SECTION_VAULT,
        &with_policy(ROLLBACK),
        false,
        ConfigAction::Reload
    )));
    assert_eq!(q.bus().transactions(), before);

    let cfg = SectionConfig {
        policy: Some(Sspr {
            wp_en: true,
            ..Default::default()
        }),
        version: Some(3),
        ..Default::default()
    };
    q.config_section(SECTION_VAULT, &cfg, false, ConfigAction::Reload)
        .unwrap();
    let info = q.get_section_configuration(SECTION_VAULT).unwrap();
    assert_eq!(info.base, u32::MAX);
    assert_eq!(info.size, 0x1_0000);
    assert!(info.policy.wp_en);
    assert_eq!(info.version, 3);
}

#[test]
fn lost_session_is_reopened() {
    let mut q = full_session(sim_with_keys(Target::W77q25nwxxiRevA), 2);
    q.bus_mut()
        .fail_next_ending_session(SecCmd::SetScr, Ssr::SYS_ERR);
    q.config_section(2, &with_policy(OPEN), false, ConfigAction::Reload)
        .unwrap();
    assert_eq!(q.bus().scr(2).unwrap().policy().unwrap(), OPEN);
    assert_eq!(q.bus().session_kid(), Some(Kid::full(2)));
    assert_eq!(q.context().key_mngr().kid(), Kid::full(2));
}

#[test]
fn unconfirmed_write_fails() {
    let mut q = full_session(sim_with_keys(Target::W77q25nwxxiRevA), 2);
    // the device drops the command without raising anything
    q.bus_mut().fail_next(SecCmd::SetScr, 0);
    assert!(matches!(
        q.config_section(2, &with_policy(OPEN), false, ConfigAction::Reload),
        Err(QlibError::CommandFail)
    ));
    assert_eq!(q.bus().scr(2), Some(Scr::default()));
}

#[test]
fn reset_action_restarts_the_part() {
    let mut q = full_session(sim_with_keys(Target::W77q25nwxxiRevA), 5);
    let dmc = q.bus().mc()[1];
    q.config_section(5, &with_policy(OPEN), false, ConfigAction::Reset)
        .unwrap();
    assert_eq!(q.bus().mc()[1], dmc + 1);
    assert_eq!(q.bus().scr(5).unwrap().policy().unwrap(), OPEN);
    assert!(!q.context().key_mngr().is_session_open());
    assert!(!q.context().reset_status.power_on);

    // plain access follows the new policy straight away
    let mut buf = [0u8; 4];
    q.plain_read(5, 0, &mut buf).unwrap();
    assert_eq!(buf, [0xff; 4]);
}

#[test]
fn section_configuration_reads() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    sim.set_scr(
        4,
        Scr {
            sspr: OPEN.to_u32().unwrap(),
            checksum: 0xc0ff_ee00,
            digest: 0x1122_3344_5566_7788,
            version: 12,
        },
    );
    let mut q = attach(sim);
    let info = q.get_section_configuration(4).unwrap();
    assert_eq!(info.base, 0x4_0000);
    assert_eq!(info.size, 0x1_0000);
    assert_eq!(info.policy, OPEN);
    assert_eq!(info.crc, 0xc0ff_ee00);
    assert_eq!(info.digest, 0x1122_3344_5566_7788);
    assert_eq!(info.version, 12);

    let mut gmt = q.get_gmt_unsigned().unwrap();
    gmt.set_smr(7, Smr::new(0, 0, false, 1));
    q.configure_device(key(MASTER_HEX), None, Some(&gmt)).unwrap();
    let info = q.get_section_configuration(7).unwrap();
    assert_eq!(info, Default::default());

    assert!(matches!(
        q.get_section_configuration(9),
        Err(QlibError::InvalidParameter(_))
    ));
}

#[test]
fn key_provisioning_status() {
    let mut sim = w77q_sec::sim::SimDevice::new(Target::W77q25nwxxiRevA);
    sim.set_master_key(*key(MASTER_HEX));
    sim.set_key(Kid::full(3), *key(FULL_HEX));
    sim.set_key(Kid::restricted(5), *key(RESTRICTED_HEX));
    let mut q = attach(sim);

    assert!(q.is_key_provisioned(Kid::full(3)).unwrap());
    assert!(!q.is_key_provisioned(Kid::restricted(3)).unwrap());
    assert!(q.is_key_provisioned(Kid::restricted(5)).unwrap());
    assert!(!q.is_key_provisioned(Kid::full(5)).unwrap());
    assert!(q.is_key_provisioned(Kid::DEVICE_MASTER).unwrap());
    assert!(!q.is_key_provisioned(Kid::DEVICE_SECRET).unwrap());
    assert!(matches!(
        q.is_key_provisioned(Kid::provisioning(1)),
        Err(QlibError::InvalidParameter(_))
    ));

    let mut q2 = attach(sim_with_keys(Target::W77q64jwRevA));
    let before = q2.bus().transactions();
    assert!(matches!(
        q2.is_key_provisioned(Kid::full(0)),
        Err(QlibError::NotSupported(_))
    ));
    assert_eq!(q2.bus().transactions(), before);
}

#[test]
fn reset_flash_moves_the_dmc() {
    let mut q = full_session(sim_with_keys(Target::W77q25nwxxiRevA), 1);
    let dmc = q.bus().mc()[1];
    q.reset_flash().unwrap();
    assert_eq!(q.bus().mc()[1], dmc + 1);
    assert_eq!(q.context().die().mc, q.bus().mc());
    assert!(!q.context().key_mngr().is_session_open());
    assert_eq!(q.bus().session_kid(), None);
    assert!(!q.context().reset_status.power_on);

    q.open_session(1, SessionAccess::Full).unwrap();
    q.write(1, 0, &[1, 2, 3]).unwrap();
}

#[test]
fn ignored_reset_is_reported() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    q.bus_mut().ignore_resets(true);
    assert!(matches!(q.reset_flash(), Err(QlibError::CommandIgnored)));

    q.bus_mut().ignore_resets(false);
    q.reset_flash().unwrap();
}

#[test]
fn device_config_reads_gmc() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    let cfg = q.get_device_config().unwrap();
    assert!(cfg.plain_format);
    assert!(!cfg.locked);
    assert_eq!(cfg.vault_size, vec![0x1_0000]);
    assert_eq!(cfg.reset_pa, vec![0]);
    assert_eq!(cfg.watchdog_default, *q.bus().awdt());

    let mut q2 = attach(sim_with_keys(Target::W77q64jwRevA));
    assert_eq!(q2.get_device_config().unwrap().vault_size, vec![0]);
}
