//! Partition type catalog.
//!
//! Human readable names of the partition types known by each label format.

use uuid::Uuid;

/// Bit that marks a hidden FAT/NTFS DOS type (`0x0c` becomes `0x1c`).
pub const DOS_HIDDEN_BIT: u8 = 0x10;

/// DOS extended partition types (CHS, LBA, Linux, DR-DOS).
pub const DOS_EXTENDED_TYPES: [u8; 5] = [0x05, 0x0f, 0x85, 0xc5, 0xd5];

/// Type written for a new DOS extended partition.
pub const DOS_EXTENDED_LBA: u8 = 0x0f;

/// Type of the protective entry of a GPT disk.
pub const DOS_GPT_PROTECTIVE: u8 = 0xee;

/// Default DOS type: Linux.
pub const DOS_LINUX: u8 = 0x83;

const DOS_TYPES: &[(u8, &str)] = &[
    (0x00, "Empty"),
    (0x01, "FAT12"),
    (0x04, "FAT16 <32M"),
    (0x05, "Extended"),
    (0x06, "FAT16"),
    (0x07, "HPFS/NTFS/exFAT"),
    (0x0b, "W95 FAT32"),
    (0x0c, "W95 FAT32 (LBA)"),
    (0x0e, "W95 FAT16 (LBA)"),
    (0x0f, "W95 Ext'd (LBA)"),
    (0x11, "Hidden FAT12"),
    (0x12, "Compaq diagnostics"),
    (0x14, "Hidden FAT16 <32M"),
    (0x16, "Hidden FAT16"),
    (0x17, "Hidden HPFS/NTFS"),
    (0x1b, "Hidden W95 FAT32"),
    (0x1c, "Hidden W95 FAT32 (LBA)"),
    (0x1e, "Hidden W95 FAT16 (LBA)"),
    (0x27, "Hidden NTFS WinRE"),
    (0x42, "SFS"),
    (0x4d, "QNX4.x"),
    (0x63, "GNU HURD or SysV"),
    (0x82, "Linux swap / Solaris"),
    (0x83, "Linux"),
    (0x85, "Linux extended"),
    (0x86, "NTFS volume set"),
    (0x87, "NTFS volume set"),
    (0x8e, "Linux LVM"),
    (0xa5, "FreeBSD"),
    (0xa6, "OpenBSD"),
    (0xa8, "Darwin UFS"),
    (0xa9, "NetBSD"),
    (0xab, "Darwin boot"),
    (0xaf, "HFS / HFS+"),
    (0xbe, "Solaris boot"),
    (0xbf, "Solaris"),
    (0xc5, "DRDOS/sec (FAT-32)"),
    (0xd5, "DRDOS/sec extended"),
    (0xda, "Non-FS data"),
    (0xee, "GPT"),
    (0xef, "EFI (FAT-12/16/32)"),
    (0xfb, "VMware VMFS"),
    (0xfc, "VMware VMKCORE"),
    (0xfd, "Linux raid autodetect"),
];

/// EFI System partition.
pub const GPT_EFI_SYSTEM: Uuid = Uuid::from_u128(0xc12a7328_f81f_11d2_ba4b_00a0c93ec93b);
/// BIOS boot partition.
pub const GPT_BIOS_BOOT: Uuid = Uuid::from_u128(0x21686148_6449_6e6f_744e_656564454649);
/// Linux filesystem data.
pub const GPT_LINUX_FILESYSTEM: Uuid = Uuid::from_u128(0x0fc63daf_8483_4772_8e79_3d69d8477de4);
/// Linux swap.
pub const GPT_LINUX_SWAP: Uuid = Uuid::from_u128(0x0657fd6d_a4ab_43c4_84e5_0933c84b4f4f);
/// Linux LVM.
pub const GPT_LINUX_LVM: Uuid = Uuid::from_u128(0xe6d6d379_f507_44c2_a23c_238f2a3df928);
/// Linux RAID.
pub const GPT_LINUX_RAID: Uuid = Uuid::from_u128(0xa19d880f_05fc_4d3b_a006_743f0f84911e);
/// Microsoft basic data.
pub const GPT_MICROSOFT_BASIC_DATA: Uuid =
    Uuid::from_u128(0xebd0a0a2_b9e5_4433_87c0_68b6b72699c7);

const GPT_TYPES: &[(Uuid, &str)] = &[
    (GPT_EFI_SYSTEM, "EFI System"),
    (GPT_BIOS_BOOT, "BIOS boot"),
    (
        Uuid::from_u128(0xe3c9e316_0b5c_4db8_817d_f92df00215ae),
        "Microsoft reserved",
    ),
    (GPT_MICROSOFT_BASIC_DATA, "Microsoft basic data"),
    (
        Uuid::from_u128(0xde94bba4_06d1_4d40_a16a_bfd50179d6ac),
        "Windows recovery environment",
    ),
    (GPT_LINUX_FILESYSTEM, "Linux filesystem"),
    (GPT_LINUX_SWAP, "Linux swap"),
    (GPT_LINUX_LVM, "Linux LVM"),
    (GPT_LINUX_RAID, "Linux RAID"),
    (
        Uuid::from_u128(0x933ac7e1_2eb4_4f13_b844_0e14e2aef915),
        "Linux home",
    ),
    (
        Uuid::from_u128(0x4f68bce3_e8cd_4db1_96e7_fbcaf984b709),
        "Linux root (x86-64)",
    ),
    (
        Uuid::from_u128(0xb921b045_1df0_41c3_af44_4c6f280d3fae),
        "Linux root (ARM-64)",
    ),
    (
        Uuid::from_u128(0xbc13c2ff_59e6_4262_a352_b275fd6f7172),
        "Linux extended boot",
    ),
    (
        Uuid::from_u128(0x48465300_0000_11aa_aa11_00306543ecac),
        "Apple HFS/HFS+",
    ),
    (
        Uuid::from_u128(0x516e7cb4_6ecf_11d6_8ff8_00022d09712b),
        "FreeBSD data",
    ),
];

const BSD_TYPES: &[(u8, &str)] = &[
    (0, "unused"),
    (1, "swap"),
    (2, "Version 6"),
    (3, "Version 7"),
    (4, "System V"),
    (5, "4.1BSD"),
    (6, "Eighth Edition"),
    (7, "4.2BSD"),
    (8, "MS-DOS"),
    (9, "4.4LFS"),
    (11, "HPFS"),
    (12, "ISO-9660"),
    (13, "boot"),
    (14, "ADOS"),
    (15, "HFS"),
    (16, "AdvFS"),
];

const SUN_TYPES: &[(u16, &str)] = &[
    (0x00, "Unassigned"),
    (0x01, "Boot"),
    (0x02, "SunOS root"),
    (0x03, "SunOS swap"),
    (0x04, "SunOS usr"),
    (0x05, "Whole disk"),
    (0x06, "SunOS stand"),
    (0x07, "SunOS var"),
    (0x08, "SunOS home"),
    (0x82, "Linux swap"),
    (0x83, "Linux native"),
    (0x8e, "Linux LVM"),
    (0xfd, "Linux raid autodetect"),
];

const SGI_TYPES: &[(u32, &str)] = &[
    (0x00, "SGI volhdr"),
    (0x01, "SGI trkrepl"),
    (0x02, "SGI secrepl"),
    (0x03, "SGI raw"),
    (0x04, "SGI bsd"),
    (0x05, "SGI sysv"),
    (0x06, "SGI volume"),
    (0x07, "SGI efs"),
    (0x08, "SGI lvol"),
    (0x09, "SGI rlvol"),
    (0x0a, "SGI xfs"),
    (0x0b, "SGI xfslog"),
    (0x0c, "SGI xlv"),
    (0x0d, "SGI xvm"),
    (0x82, "Linux swap"),
    (0x83, "Linux native"),
    (0x8e, "Linux LVM"),
    (0xfd, "Linux RAID"),
];

fn lookup<K: PartialEq>(table: &[(K, &'static str)], key: &K) -> Option<&'static str> {
    table.iter().find(|(k, _)| k == key).map(|&(_, name)| name)
}

/// Name of a DOS partition type.
pub fn dos_name(code: u8) -> Option<&'static str> {
    lookup(DOS_TYPES, &code)
}

/// Name of a GPT partition type.
pub fn gpt_name(guid: &Uuid) -> Option<&'static str> {
    lookup(GPT_TYPES, guid)
}

/// Name of a BSD partition type.
pub fn bsd_name(code: u8) -> Option<&'static str> {
    lookup(BSD_TYPES, &code)
}

/// Name of a SUN partition tag.
pub fn sun_name(code: u16) -> Option<&'static str> {
    lookup(SUN_TYPES, &code)
}

/// Name of a SGI partition type.
pub fn sgi_name(code: u32) -> Option<&'static str> {
    lookup(SGI_TYPES, &code)
}

/// Returns `true` for the DOS extended partition types.
pub fn is_dos_extended(code: u8) -> bool {
    DOS_EXTENDED_TYPES.contains(&code)
}

/// Returns `true` for the DOS types that have a hidden counterpart (FAT and NTFS).
pub fn is_dos_hideable(code: u8) -> bool {
    matches!(code & !DOS_HIDDEN_BIT, 0x01 | 0x04 | 0x06 | 0x07 | 0x0b | 0x0c | 0x0e)
}

/// Returns `true` if `code` is the hidden variant of a FAT/NTFS type.
pub fn is_dos_hidden(code: u8) -> bool {
    is_dos_hideable(code) && code & DOS_HIDDEN_BIT != 0
}

/// The GPT type matching a DOS code, used when a caller gives a DOS code to a GPT label.
pub fn gpt_from_dos(code: u8) -> Option<Uuid> {
    match code {
        0x83 => Some(GPT_LINUX_FILESYSTEM),
        0x82 => Some(GPT_LINUX_SWAP),
        0x8e => Some(GPT_LINUX_LVM),
        0xfd => Some(GPT_LINUX_RAID),
        0xef => Some(GPT_EFI_SYSTEM),
        0x07 | 0x0b | 0x0c | 0x0e => Some(GPT_MICROSOFT_BASIC_DATA),
        _ => None,
    }
}
