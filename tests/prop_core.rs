use nowdb::filter::{CmpOp, Filter};
use nowdb::sort::IndexKeys;
use nowdb::types::{Content, Edge, OFF_DESTIN, OFF_ORIGIN, OFF_TMSTMP, Typ};
use proptest::prelude::*;

fn edge_with(ts: i64, origin: u64, destin: u64) -> [u8; 64] {
    Edge {
        edge: 1,
        origin,
        destin,
        label: 0,
        timestamp: ts,
        weight: 0,
        weight2: 0,
        wtype: Typ::Nothing,
        wtype2: Typ::Nothing,
    }
    .to_bytes()
}

fn ts_cmp(op: CmpOp, val: i64) -> Filter {
    Filter::Cmp { op, off: OFF_TMSTMP, size: 8, typ: Typ::Time, val: val as u64 }
}

proptest! {
    // every record matched by a timestamp conjunction lies in its period
    #[test]
    fn period_is_sound(
        lo in -1_000_000i64..1_000_000,
        hi in -1_000_000i64..1_000_000,
        ts in -1_000_000i64..1_000_000,
    ) {
        let f = ts_cmp(CmpOp::Ge, lo).and(ts_cmp(CmpOp::Le, hi));
        let (start, end) = f.period();
        let rec = edge_with(ts, 0, 0);
        if f.eval(&rec) {
            prop_assert!(ts >= start && ts <= end);
        }
    }

    // mangled keys order exactly like field-wise comparison
    #[test]
    fn mangle_preserves_order(
        a in any::<(u64, i64)>(),
        b in any::<(u64, i64)>(),
    ) {
        let keys = IndexKeys::new(
            Content::Edge,
            vec![OFF_ORIGIN as u16, OFF_TMSTMP as u16],
        );
        let ka = keys.extract(&edge_with(a.1, a.0, 0));
        let kb = keys.extract(&edge_with(b.1, b.0, 0));
        let by_fields = keys.compare_keys(&ka, &kb);
        let by_bytes = keys.mangle(&ka).cmp(&keys.mangle(&kb));
        prop_assert_eq!(by_fields, by_bytes);
        prop_assert_eq!(keys.unmangle(&keys.mangle(&ka)), ka);
    }

    // composite-key extraction is stable under record reordering
    #[test]
    fn extracted_keys_identify_records(o in any::<u64>(), d in any::<u64>()) {
        let keys = IndexKeys::new(
            Content::Edge,
            vec![OFF_ORIGIN as u16, OFF_DESTIN as u16],
        );
        let k = keys.extract(&edge_with(0, o, d));
        prop_assert_eq!(u64::from_le_bytes(k[0..8].try_into().unwrap()), o);
        prop_assert_eq!(u64::from_le_bytes(k[8..16].try_into().unwrap()), d);
    }
}
