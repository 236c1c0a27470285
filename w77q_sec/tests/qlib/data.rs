// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::common::*;
use crc_any::CRC;
use w77q_regs::config::{Scr, Sspr};
use w77q_regs::status::Ssr;
use w77q_sec::cmd::SecCmd;
use w77q_sec::{DeviceError, QlibConfig, QlibError, SessionAccess, Target};

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
}

fn full_session(target: Target, section: u8) -> SimQlib {
    let mut q = attach(sim_with_keys(target));
    register_keys(&mut q, section);
    q.open_session(section, SessionAccess::Full).unwrap();
    q
}

#[test]
fn write_then_read_back() {
    let mut q = full_session(Target::W77q25nwxxiRevA, 1);
    let data = pattern(100, 3);
    q.write(1, 5, &data).unwrap();

    let base = section_base(1);
    assert_eq!(&q.bus().flash()[base + 5..base + 105], &data[..]);
    // bytes around the write keep their erased value
    assert_eq!(q.bus().flash()[base + 4], 0xff);
    assert_eq!(q.bus().flash()[base + 105], 0xff);

    let mut unaligned = vec![0u8; 100];
    q.read(1, 5, &mut unaligned, false).unwrap();
    assert_eq!(unaligned, data);

    let mut signed = vec![0u8; 100];
    q.read(1, 5, &mut signed, true).unwrap();
    assert_eq!(signed, data);

    let mut pages = vec![0u8; 128];
    q.read(1, 0, &mut pages, false).unwrap();
    assert_eq!(&pages[5..105], &data[..]);
    assert!(pages[105..].iter().all(|&b| b == 0xff));
}

#[test]
fn failed_page_stops_a_multi_page_read() {
    let mut q = full_session(Target::W77q25nwxxiRevA, 1);
    let data = pattern(128, 9);
    q.write(1, 0, &data).unwrap();
    let before = q.bus().mc();

    q.bus_mut().fail_next(SecCmd::Srd, Ssr::SYS_ERR);
    let mut pages = vec![0u8; 128];
    let err = q.read(1, 0, &mut pages, false).unwrap_err();
    assert!(matches!(err, QlibError::Device(DeviceError::System)));
    // the dropped page was the only SRD the device saw
    assert_eq!(q.bus().mc(), before);
    assert!(!q.context().multi_transaction);

    q.read(1, 0, &mut pages, false).unwrap();
    assert_eq!(pages, data);
    assert_eq!(q.context().die().mc, q.bus().mc());
}

#[test]
fn restricted_session_is_read_only() {
    let mut q = attach(sim_with_keys(Target::W77q25nwxxiRevA));
    register_keys(&mut q, 2);
    q.open_session(2, SessionAccess::Restricted).unwrap();
    let before = q.bus().transactions();
    assert!(matches!(
        q.write(2, 0, &[0; 4]),
        Err(QlibError::Device(DeviceError::Privilege))
    ));
    assert!(matches!(
        q.erase(2, 0, 0x1000),
        Err(QlibError::Device(DeviceError::Privilege))
    ));
    assert_eq!(q.bus().transactions(), before);

    let mut buf = [0u8; 32];
    q.read(2, 0, &mut buf, false).unwrap();
}

#[test]
fn session_is_bound_to_its_section() {
    let mut q = full_session(Target::W77q25nwxxiRevA, 0);
    let mut buf = [0u8; 32];
    assert!(matches!(
        q.read(1, 0, &mut buf, false),
        Err(QlibError::Device(DeviceError::Privilege))
    ));
}

#[test]
fn write_protected_section_rejects_writes() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    sim.set_policy(
        3,
        Sspr {
            wp_en: true,
            ..Default::default()
        },
    );
    let mut q = attach(sim);
    register_keys(&mut q, 3);
    q.open_session(3, SessionAccess::Full).unwrap();
    let err = q.write(3, 0, &[1, 2, 3]).unwrap_err();
    assert!(matches!(err, QlibError::Device(DeviceError::Privilege)));
    assert!(q.bus().flash()[section_base(3)..section_base(3) + 3]
        .iter()
        .all(|&b| b == 0xff));
}

#[test]
fn erase_ranges() {
    let mut q = full_session(Target::W77q25nwxxiRevA, 1);
    let base = section_base(1);
    q.bus_mut().flash_mut()[base..base + 0x1_0000].fill(0);

    q.erase(1, 0x1000, 0x2000).unwrap();
    let flash = q.bus().flash();
    assert!(flash[base..base + 0x1000].iter().all(|&b| b == 0));
    assert!(flash[base + 0x1000..base + 0x3000].iter().all(|&b| b == 0xff));
    assert!(flash[base + 0x3000..base + 0x1_0000].iter().all(|&b| b == 0));

    q.erase(1, 0, 0x1_0000).unwrap();
    assert!(q.bus().flash()[base..base + 0x1_0000].iter().all(|&b| b == 0xff));

    assert!(matches!(
        q.erase(1, 0, 0x800),
        Err(QlibError::InvalidParameter(_))
    ));
    assert!(matches!(
        q.erase(1, 0xf000, 0x2000),
        Err(QlibError::OutOfRange(_))
    ));
}

#[test]
fn erase_whole_section() {
    let mut q = full_session(Target::W77q25nwxxiRevA, 4);
    let base = section_base(4);
    q.bus_mut().flash_mut()[base - 16..base + 0x1_0010].fill(0);

    q.erase_section(4, true).unwrap();
    let flash = q.bus().flash();
    assert!(flash[base..base + 0x1_0000].iter().all(|&b| b == 0xff));
    assert!(flash[base - 16..base].iter().all(|&b| b == 0));
    assert!(flash[base + 0x1_0000..base + 0x1_0010].iter().all(|&b| b == 0));
}

#[test]
fn copy_and_checksum() {
    let mut q = full_session(Target::W77q25nwxxiRevA, 1);
    let data = pattern(0x100, 0x11);
    q.write(1, 0, &data).unwrap();
    q.copy_within_section(1, 0x2000, 0, 0x100).unwrap();

    let base = section_base(1);
    assert_eq!(&q.bus().flash()[base + 0x2000..base + 0x2100], &data[..]);

    let mut crc = CRC::crc32();
    crc.digest(&data);
    assert_eq!(q.section_crc(1, 0x2000, 0x100).unwrap(), crc.get_crc() as u32);

    assert!(matches!(
        q.copy_within_section(1, 0x80, 0, 0x100),
        Err(QlibError::OutOfRange(_))
    ));
}

#[test]
fn checksum_needs_a_supporting_part() {
    let mut q = full_session(Target::W77q128jvRevA, 0);
    let before = q.bus().transactions();
    assert!(matches!(
        q.section_crc(0, 0, 0x100),
        Err(QlibError::NotSupported(_))
    ));
    assert_eq!(q.bus().transactions(), before);
}

#[test]
fn secure_log_append_and_read() {
    let mut sim = sim_with_keys(Target::W77q25nwxxiRevA);
    let log = Sspr {
        slog: true,
        pa_rd_en: true,
        pa_wr_en: true,
        ..Default::default()
    };
    sim.set_policy(2, log);
    sim.set_policy(3, log);
    let mut q = attach(sim);
    register_keys(&mut q, 2);

    assert_eq!(q.secure_log_read(3, false).unwrap(), (0, [0xff; 16]));

    q.open_session(2, SessionAccess::Full).unwrap();
    let entries = pattern(32, 0x40);
    q.secure_log_write(2, &entries, true).unwrap();
    let (head, entry) = q.secure_log_read(2, true).unwrap();
    assert_eq!(head, 16);
    assert_eq!(&entry[..], &entries[16..]);

    let base = section_base(2);
    assert_eq!(&q.bus().flash()[base..base + 32], &entries[..]);

    q.close_session(2).unwrap();
    let plain = [0x77u8; 16];
    q.secure_log_write(2, &plain, false).unwrap();
    assert_eq!(q.secure_log_read(2, false).unwrap(), (32, plain));
}

#[test]
fn log_needs_a_log_section() {
    let mut q = full_session(Target::W77q25nwxxiRevA, 5);
    let err = q.secure_log_write(5, &[0; 16], true).unwrap_err();
    assert!(matches!(err, QlibError::Device(DeviceError::Privilege)));
}

#[test]
fn large_commands_are_split() {
    for target in [Target::W77q64jwRevA, Target::W77q25nwxxiRevA] {
        let mut config = QlibConfig::default();
        config.bus.max_write = 20;
        let mut q = attach_with(sim_with_keys(target), config);
        register_keys(&mut q, 0);
        q.open_session(0, SessionAccess::Full).unwrap();

        let data = pattern(64, 0x21);
        q.write(0, 0x40, &data).unwrap();
        assert_eq!(&q.bus().flash()[0x40..0x80], &data[..], "{target}");
    }
}

#[test]
fn large_commands_need_split_support() {
    let mut config = QlibConfig::default();
    config.bus.max_write = 20;
    let mut q = attach_with(sim_with_keys(Target::W77q32jwRevB), config);
    register_keys(&mut q, 0);
    q.open_session(0, SessionAccess::Full).unwrap();
    let err = q.write(0, 0, &[0; 32]).unwrap_err();
    assert!(matches!(err, QlibError::InvalidDataSize { limit: 20, .. }));
}

fn rollback_scr() -> Scr {
    let policy = Sspr {
        rollback_en: true,
        ..Default::default()
    };
    Scr {
        sspr: policy.to_u32().unwrap(),
        version: 1,
        ..Default::default()
    }
}

#[test]
fn swap_exchanges_section_halves() {
    let mut q = full_session(Target::W77q25nwxxiRevA, 3);
    let half = 0x8000;
    q.write(3, 0, b"active image").unwrap();
    q.write(3, half, b"backup image").unwrap();

    q.set_scr_swap(3, &rollback_scr(), false, true).unwrap();
    assert_eq!(q.bus().scr(3), Some(rollback_scr()));
    assert!(q.context().key_mngr().is_section_full_access(3));

    let mut buf = [0u8; 12];
    q.read(3, 0, &mut buf, true).unwrap();
    assert_eq!(&buf, b"backup image");
    q.read(3, half, &mut buf, true).unwrap();
    assert_eq!(&buf, b"active image");
}

#[test]
fn swap_with_reset_restarts_the_part() {
    let mut q = full_session(Target::W77q25nwxxiRevA, 3);
    q.write(3, 0, b"old").unwrap();
    q.write(3, 0x8000, b"new").unwrap();

    q.set_scr_swap(3, &rollback_scr(), true, false).unwrap();
    let base = section_base(3);
    assert_eq!(&q.bus().flash()[base..base + 3], b"new");
    assert_eq!(&q.bus().flash()[base + 0x8000..base + 0x8003], b"old");
    assert_eq!(q.bus().scr(3), Some(rollback_scr()));
    assert!(!q.context().key_mngr().is_session_open());

    q.sync_state().unwrap();
    assert!(!q.context().reset_status.power_on);
}

#[test]
fn swap_needs_a_rollback_section() {
    let mut q = full_session(Target::W77q25nwxxiRevA, 3);
    q.write(3, 0, b"keep").unwrap();
    let err = q.set_scr_swap(3, &Scr::default(), false, true).unwrap_err();
    assert!(matches!(err, QlibError::Device(DeviceError::Generic)));
    let base = section_base(3);
    assert_eq!(&q.bus().flash()[base..base + 4], b"keep");
    assert_eq!(q.bus().scr(3), Some(Scr::default()));
}
