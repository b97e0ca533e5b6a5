//! Fixed page header layout and page-id helpers.

use crate::constants::{HEADER_SIZE, PGID_LOCALID_MASK, PGID_LOCAL_BITS, PGID_INVALID};
use crate::encode::{decode_u32, decode_u64, decode_u8, encode_u32, encode_u64, encode_u8};

/// A 64-bit page id, structured as `partid:52..63 | local:0..51`.
pub type PageId = u64;

pub const ID_OFFSET: usize = 0;
pub const OVR_TGT_OFFSET: usize = 8;
pub const TXID_OFFSET: usize = 16;
pub const TYPE_OFFSET: usize = 24;
pub const FLAGS_OFFSET: usize = 25;
pub const CRC_OFFSET: usize = 26;

const _: () = assert!(HEADER_SIZE >= CRC_OFFSET + 4);

bitflags::bitflags! {
    /// Page header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        /// This page is a committed page.
        const VALID = 1 << 0;
        /// This page is the scan anchor: the final page of a commit.
        const END_TX = 1 << 1;
        /// This page is the final page of a rebase (only valid with END_TX).
        const TX_REBASE = 1 << 2;
    }
}

/// Page type tag, stored in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Invalid = 0,
    Node = 1,
    Leaf = 2,
    DupKeyNode = 3,
    DupKeyLeaf = 4,
    Overview = 5,
    OverflowStreak = 6,
    Debug = 7,
}

impl PageType {
    pub fn from_u8(v: u8) -> PageType {
        match v {
            1 => PageType::Node,
            2 => PageType::Leaf,
            3 => PageType::DupKeyNode,
            4 => PageType::DupKeyLeaf,
            5 => PageType::Overview,
            6 => PageType::OverflowStreak,
            7 => PageType::Debug,
            _ => PageType::Invalid,
        }
    }
}

/// Builds a page id from a partition id and a local id within it.
pub fn pgid_make(partid: u16, local: u64) -> PageId {
    ((partid as u64) << PGID_LOCAL_BITS) | (local & PGID_LOCALID_MASK)
}

pub fn pgid_partid(pgid: PageId) -> u16 {
    (pgid >> PGID_LOCAL_BITS) as u16
}

pub fn pgid_local(pgid: PageId) -> u64 {
    pgid & PGID_LOCALID_MASK
}

pub fn pgid_is_invalid(pgid: PageId) -> bool {
    pgid == PGID_INVALID
}

pub fn pgid2str(pgid: PageId) -> String {
    if pgid_is_invalid(pgid) {
        "INVALID".to_string()
    } else {
        format!("{:03x}:{}", pgid_partid(pgid), pgid_local(pgid))
    }
}

/// Reads every header field out of a raw `PAGE_SIZE` buffer.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub id: PageId,
    pub id_ovr_tgt: PageId,
    pub txid: u64,
    pub page_type: PageType,
    pub flags: Flags,
}

pub fn read_header(buf: &[u8]) -> Header {
    Header {
        id: decode_u64(buf, ID_OFFSET),
        id_ovr_tgt: decode_u64(buf, OVR_TGT_OFFSET),
        txid: decode_u64(buf, TXID_OFFSET),
        page_type: PageType::from_u8(decode_u8(buf, TYPE_OFFSET)),
        flags: Flags::from_bits_truncate(decode_u8(buf, FLAGS_OFFSET)),
    }
}

pub fn write_header(buf: &mut [u8], hdr: &Header) {
    encode_u64(buf, ID_OFFSET, hdr.id);
    encode_u64(buf, OVR_TGT_OFFSET, hdr.id_ovr_tgt);
    encode_u64(buf, TXID_OFFSET, hdr.txid);
    encode_u8(buf, TYPE_OFFSET, hdr.page_type as u8);
    encode_u8(buf, FLAGS_OFFSET, hdr.flags.bits());
}

pub fn init_header(buf: &mut [u8], id: PageId, page_type: PageType) {
    write_header(
        buf,
        &Header {
            id,
            id_ovr_tgt: PGID_INVALID,
            txid: crate::constants::TXID_INVALID,
            page_type,
            flags: Flags::empty(),
        },
    );
}

/// CRC32 over header (excluding the checksum field itself) + body.
pub fn compute_checksum(buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[..CRC_OFFSET]);
    hasher.update(&buf[CRC_OFFSET + 4..]);
    hasher.finalize()
}

pub fn write_checksum(buf: &mut [u8]) {
    let crc = compute_checksum(buf);
    encode_u32(buf, CRC_OFFSET, crc);
}

pub fn verify_checksum(buf: &[u8]) -> bool {
    decode_u32(buf, CRC_OFFSET) == compute_checksum(buf)
}
