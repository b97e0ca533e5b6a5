//! Page header, body layouts, and per-type dispatch.

pub mod debug;
pub mod dupkey;
pub mod header;
pub mod leaf;
pub mod node;
pub mod overflow;
pub mod overview;

pub use header::{
    compute_checksum, init_header, pgid2str, pgid_is_invalid, pgid_local, pgid_make, pgid_partid,
    read_header, verify_checksum, write_checksum, write_header, Flags, Header, PageId, PageType,
    CRC_OFFSET, FLAGS_OFFSET, ID_OFFSET, OVR_TGT_OFFSET, TXID_OFFSET, TYPE_OFFSET,
};

use crate::constants::{BODY_SIZE, HEADER_SIZE};

/// Extracts the `[HEADER_SIZE, HEADER_SIZE+BODY_SIZE)` body slice.
pub fn body(buf: &[u8]) -> &[u8] {
    &buf[HEADER_SIZE..HEADER_SIZE + BODY_SIZE]
}

pub fn body_mut(buf: &mut [u8]) -> &mut [u8] {
    &mut buf[HEADER_SIZE..HEADER_SIZE + BODY_SIZE]
}

pub fn streak(buf: &[u8]) -> &[u8] {
    &buf[HEADER_SIZE + BODY_SIZE..]
}

pub fn streak_mut(buf: &mut [u8]) -> &mut [u8] {
    &mut buf[HEADER_SIZE + BODY_SIZE..]
}

/// Text dump of a page's structure, used for debugging and tests.
pub fn dump(buf: &[u8]) -> String {
    let hdr = read_header(buf);
    let mut s = format!(
        "page {} type={:?} ovr_tgt={} txid={} flags={:?}\n",
        pgid2str(hdr.id),
        hdr.page_type,
        pgid2str(hdr.id_ovr_tgt),
        hdr.txid,
        hdr.flags
    );
    match hdr.page_type {
        PageType::Node => {
            let view = node::NodeView::new(body(buf));
            s += &format!("  ptr-1={}\n", pgid2str(view.ptr_neg1()));
            for e in view.entries() {
                s += &format!("  key={:?} ptr={}\n", e.key, pgid2str(e.ptr));
            }
        }
        PageType::Leaf => {
            let view = leaf::LeafView::new(body(buf));
            for i in 0..view.num_kvs() {
                let r = view.record_at(i);
                s += &format!("  key={:?} value={:?}\n", r.key, r.value);
            }
        }
        PageType::DupKeyLeaf => {
            let view = dupkey::DupKeyLeafView::new(body(buf));
            s += &format!("  key={:?} n={}\n", view.key(), view.num_values());
        }
        PageType::DupKeyNode => {
            let view = dupkey::DupKeyNodeView::new(body(buf));
            s += &format!("  key={:?} lvl={}\n", view.key(), view.level());
            for (ptr, free) in view.children() {
                s += &format!("  child={} free={}\n", pgid2str(ptr), free);
            }
        }
        PageType::Overview => {
            let view = overview::OverviewView::new(body(buf));
            s += &format!("  layout_ver={}\n", view.layout_version());
            for (id, root, _) in view.entries() {
                s += &format!("  table={:?} root={}\n", id, pgid2str(root));
            }
        }
        PageType::OverflowStreak => {
            let view = overflow::OverflowStreakView::new(body(buf));
            s += &format!("  size={}\n", view.size());
        }
        PageType::Debug | PageType::Invalid => {}
    }
    s
}

#[cfg(feature = "debug-dump")]
pub fn dump_graph(bufs: &[(PageId, Vec<u8>)]) -> String {
    let mut s = String::from("digraph pages {\n");
    for (pgid, buf) in bufs {
        let hdr = read_header(buf);
        s += &format!("  \"{}\" [label=\"{:?}\"];\n", pgid2str(*pgid), hdr.page_type);
        if hdr.page_type == PageType::Node {
            let view = node::NodeView::new(body(buf));
            s += &format!("  \"{}\" -> \"{}\";\n", pgid2str(*pgid), pgid2str(view.ptr_neg1()));
            for e in view.entries() {
                s += &format!("  \"{}\" -> \"{}\";\n", pgid2str(*pgid), pgid2str(e.ptr));
            }
        }
    }
    s += "}\n";
    s
}
