/// Bundle processing control flags (primary block field 2).
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct BundleFlags {
    pub is_fragment: bool,
    pub is_admin_record: bool,
    pub must_not_fragment: bool,
    pub acknowledgement_requested: bool,
    pub status_time_requested: bool,
    pub reception_report_requested: bool,
    pub forward_report_requested: bool,
    pub delivery_report_requested: bool,
    pub deletion_report_requested: bool,
}

type Get = fn(&BundleFlags) -> bool;
type Set = fn(&mut BundleFlags);

/// Bit assignments per RFC 9171 section 4.2.3.
const BITMAP: &[(u64, Get, Set)] = &[
    (0x00001, |f| f.is_fragment, |f| f.is_fragment = true),
    (0x00002, |f| f.is_admin_record, |f| f.is_admin_record = true),
    (
        0x00004,
        |f| f.must_not_fragment,
        |f| f.must_not_fragment = true,
    ),
    (
        0x00020,
        |f| f.acknowledgement_requested,
        |f| f.acknowledgement_requested = true,
    ),
    (
        0x00040,
        |f| f.status_time_requested,
        |f| f.status_time_requested = true,
    ),
    (
        0x04000,
        |f| f.reception_report_requested,
        |f| f.reception_report_requested = true,
    ),
    (
        0x10000,
        |f| f.forward_report_requested,
        |f| f.forward_report_requested = true,
    ),
    (
        0x20000,
        |f| f.delivery_report_requested,
        |f| f.delivery_report_requested = true,
    ),
    (
        0x40000,
        |f| f.deletion_report_requested,
        |f| f.deletion_report_requested = true,
    ),
];

impl From<u64> for BundleFlags {
    fn from(value: u64) -> Self {
        let mut flags = Self::default();
        for (mask, _, set) in BITMAP {
            if value & mask != 0 {
                set(&mut flags);
            }
        }
        flags
    }
}

impl From<BundleFlags> for u64 {
    fn from(value: BundleFlags) -> Self {
        let mut bits = 0;
        for (mask, get, _) in BITMAP {
            if get(&value) {
                bits |= mask;
            }
        }
        bits
    }
}
