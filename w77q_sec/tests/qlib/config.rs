// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::common::*;
use w77q_regs::config::{Devcfg, Gmc, Smr, Sspr, VaultConfig};
use w77q_sec::cmd::SecCmd;
use w77q_sec::sec::DMC_EOL_THRESHOLD;
use w77q_sec::sim::SimDevice;
use w77q_sec::{DeviceError, Notifications, Qlib, QlibConfig, QlibError, SessionAccess, Target};

#[test]
fn detects_the_part_from_hw_ver() {
    for target in [
        Target::W77q32jwRevB,
        Target::W77q64jwRevA,
        Target::W77q128jvRevA,
        Target::W77q25nwxxiRevA,
        Target::W77t25nwxxaRevA,
    ] {
        let q = attach(SimDevice::new(target));
        assert_eq!(q.capabilities().unwrap().target, target);
    }
}

#[test]
fn vault_appears_only_where_supported() {
    let q = attach(SimDevice::new(Target::W77q25nwxxiRevA));
    let vault = q.context().die().section(w77q_regs::SECTION_VAULT).unwrap();
    assert!(vault.enabled);
    assert_eq!(vault.size, 0x1_0000);

    let q = attach(SimDevice::new(Target::W77q128jvRevA));
    let vault = q.context().die().section(w77q_regs::SECTION_VAULT).unwrap();
    assert!(!vault.enabled);
}

#[test]
fn commands_need_the_bus() {
    let mut q = Qlib::new(SimDevice::new(Target::W77q25nwxxiRevA), entropy(), QlibConfig::default());
    assert!(matches!(q.get_hw_version(), Err(QlibError::NotConnected)));
    q.connect().unwrap();
    assert!(matches!(q.connect(), Err(QlibError::DeviceBusy)));
    q.get_hw_version().unwrap();
    q.disconnect().unwrap();
    assert!(matches!(q.disconnect(), Err(QlibError::IncorrectState)));
}

#[test]
fn feature_gated_commands_need_cfg_init() {
    let mut q = Qlib::new(SimDevice::new(Target::W77q25nwxxiRevA), entropy(), QlibConfig::default());
    q.connect().unwrap();
    assert!(matches!(q.sync_state(), Err(QlibError::IncorrectState)));
    q.cfg_init(Some(Target::W77q25nwxxiRevA)).unwrap();
    q.sync_state().unwrap();
}

#[test]
fn stuck_busy_times_out() {
    let mut config = QlibConfig::default();
    config.timeouts.secure_cmd_us = 2_000;
    let mut q = attach_with(SimDevice::new(Target::W77q25nwxxiRevA), config);
    q.bus_mut().set_stuck_busy(true);
    assert!(matches!(q.get_hw_version(), Err(QlibError::Timeout)));
    q.bus_mut().set_stuck_busy(false);
    q.get_hw_version().unwrap();
}

#[test]
fn remap_sections() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    let mut gmt = q.get_gmt_unsigned().unwrap();
    // section 0 grows to 128KiB over the old section 1; 1 and 7 go away
    gmt.set_smr(0, Smr::new(0, 1, true, 1));
    gmt.set_smr(1, Smr::new(0, 0, false, 1));
    gmt.set_smr(7, Smr::new(0, 0, false, 1));
    q.configure_device(key(MASTER_HEX), None, Some(&gmt)).unwrap();

    let die = q.context().die();
    assert_eq!(die.section(0).unwrap().size, 0x2_0000);
    assert!(!die.section(1).unwrap().enabled);
    assert!(!die.section(7).unwrap().enabled);
    assert!(die.section(2).unwrap().enabled);
    assert!(!q.context().key_mngr().is_session_open());
    assert_eq!(q.bus().session_kid(), None);

    register_keys(&mut q, 0);
    q.open_session(0, SessionAccess::Full).unwrap();
    q.write(0, 0x1_0000, &[0x42; 4]).unwrap();
    assert_eq!(&q.bus().flash()[0x1_0000..0x1_0004], &[0x42; 4]);
}

#[test]
fn configure_device_needs_the_master_key() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    let gmc = q.bus().gmc();
    let err = q.configure_device(key(FULL_HEX), Some(&gmc), None).unwrap_err();
    assert!(err.is_auth_failure(), "{err:?}");

    register_keys(&mut q, 0);
    q.open_session(0, SessionAccess::Restricted).unwrap();
    assert!(matches!(
        q.configure_device(key(MASTER_HEX), Some(&gmc), None),
        Err(QlibError::IncorrectState)
    ));
}

#[test]
fn reset_grants_follow_devcfg() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    sim.set_policy(
        3,
        Sspr {
            pa_rd_en: true,
            auth_pa: true,
            ..Default::default()
        },
    );
    let mut q = attach(sim);
    assert!(!q.context().die().section(3).unwrap().plain_rd);

    let old = q.bus().gmc();
    let mut devcfg = old.devcfg().unwrap();
    devcfg.rst_pa = 1 << 3;
    devcfg.vault = VaultConfig::Vault128KbRpmcDisabled.into();
    let gmc = Gmc::new(old.awdt_dflt, devcfg.to_u32().unwrap(), old.version);
    q.configure_device(key(MASTER_HEX), Some(&gmc), None).unwrap();
    assert_eq!(q.context().die().vault_size, 0x2_0000);

    q.bus_mut().power_cycle();
    q.sync_state().unwrap();
    assert!(q.context().die().section(3).unwrap().plain_rd);
    let mut buf = [0u8; 8];
    q.plain_read(3, 0, &mut buf).unwrap();
}

#[test]
fn format_restores_factory_state() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    sim.flash_mut().fill(0);
    let mut q = attach(sim);

    let mut gmt = q.get_gmt_unsigned().unwrap();
    gmt.set_smr(7, Smr::new(0, 0, false, 1));
    q.configure_device(key(MASTER_HEX), None, Some(&gmt)).unwrap();

    q.format_device(key(MASTER_HEX), false, true).unwrap();
    assert!(q.bus().flash().iter().all(|&b| b == 0xff));
    assert_eq!(q.bus().key(w77q_sec::Kid::full(0)), None);
    assert!(q.bus().key(w77q_sec::Kid::DEVICE_MASTER).is_some());

    q.sync_state().unwrap();
    assert!(q.context().die().section(7).unwrap().enabled);
}

#[test]
fn plain_format_follows_devcfg() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    q.bus_mut().flash_mut()[..16].fill(0);
    q.format(false, false).unwrap();
    assert!(q.bus().flash()[..16].iter().all(|&b| b == 0xff));

    let old = q.bus().gmc();
    let mut devcfg = old.devcfg().unwrap();
    devcfg.format_en = false;
    let gmc = Gmc::new(old.awdt_dflt, devcfg.to_u32().unwrap(), old.version);
    q.configure_device(key(MASTER_HEX), Some(&gmc), None).unwrap();
    assert!(matches!(
        q.format(false, false),
        Err(QlibError::Device(DeviceError::Privilege))
    ));
}

#[test]
fn gmc_write_retries_sys_err() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    let old = q.bus().gmc();
    let mut devcfg: Devcfg = old.devcfg().unwrap();
    devcfg.rst_pa = 0x81;
    let gmc = Gmc::new(old.awdt_dflt, devcfg.to_u32().unwrap(), old.version);

    q.bus_mut().fail_next(SecCmd::SetGmc, w77q_regs::status::Ssr::SYS_ERR);
    q.configure_device(key(MASTER_HEX), Some(&gmc), None).unwrap();
    assert_eq!(q.bus().gmc(), gmc);
}

#[test]
fn counter_notifications() {
    let mut sim = SimDevice::new(Target::W77q25nwxxiRevA);
    sim.set_mc(0x3FFF_FFF5, DMC_EOL_THRESHOLD);
    sim.set_mc_maint(1);
    let mut q = attach(sim);

    assert_eq!(
        q.get_notifications().unwrap(),
        Notifications {
            mc_maintenance: true,
            replace_device: true,
            reset_device: true,
        }
    );

    q.perform_mc_maintenance().unwrap();
    assert!(!q.get_notifications().unwrap().mc_maintenance);
}

#[test]
fn fresh_part_needs_nothing() {
    let mut q = attach(SimDevice::new(Target::W77q128jvRevA));
    assert_eq!(q.get_notifications().unwrap(), Notifications::default());
    q.get_status().unwrap();
}

#[test]
fn ecc_errors_in_status() {
    let mut q = attach(SimDevice::new(Target::W77q25nwxxaRevA));
    q.get_status().unwrap();

    q.bus_mut().set_ecc_events(true, false);
    q.get_status().unwrap();

    q.bus_mut().set_ecc_events(false, true);
    assert!(matches!(
        q.get_status(),
        Err(QlibError::Device(DeviceError::Flash))
    ));
}

#[test]
fn power_down_blocks_secure_commands() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    register_keys(&mut q, 0);
    q.power_down().unwrap();
    assert!(matches!(
        q.open_session(0, SessionAccess::Full),
        Err(QlibError::CommandIgnored)
    ));
    assert!(matches!(q.get_hw_version(), Err(QlibError::CommandIgnored)));
    q.power_up().unwrap();
    q.open_session(0, SessionAccess::Full).unwrap();
}
