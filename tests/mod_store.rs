use nowdb::io::comp::Comp;
use nowdb::store::worker::sort_step;
use nowdb::store::{Store, StoreConfig};
use nowdb::types::{Content, Edge, OFF_TMSTMP, PAGE_SIZE, Typ, read_i64};

fn edge_cfg(name: &str) -> StoreConfig {
    StoreConfig {
        name: name.to_string(),
        context: Some(name.to_string()),
        content: Content::Edge,
        recsize: 64,
        blocksize: PAGE_SIZE as u32,
        filesize: 1024 * 1024,
        largesize: 8 * 1024 * 1024,
        comp: Comp::Zstd,
        sort: Some("edge_stamp".to_string()),
        stamped: true,
    }
}

fn edge(ts: i64, origin: u64) -> [u8; 64] {
    Edge {
        edge: 1,
        origin,
        destin: 2,
        label: 0,
        timestamp: ts,
        weight: 0,
        weight2: 0,
        wtype: Typ::Nothing,
        wtype2: Typ::Nothing,
    }
    .to_bytes()
}

/// One writer file holds this many 64-byte records.
const PER_FILE: u64 = 1024 * 1024 / 64;

#[test]
fn insert_appends_to_writer() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::create(dir.path(), edge_cfg("buys")).unwrap();
    let rec = edge(5, 7);
    store.insert(&rec).unwrap();
    // the last recordsize bytes of the writer's live region are the record
    assert_eq!(store.writer_last(64).unwrap(), rec.to_vec());
    assert_eq!(store.writer_size(), 64);
    let (w, wait, rd, sp) = store.counts();
    assert_eq!((w, wait, rd, sp), (1, 0, 0, 0));
}

#[test]
fn rollover_moves_writer_to_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::create(dir.path(), edge_cfg("buys")).unwrap();
    for i in 0..PER_FILE {
        store.insert(&edge(i as i64, i)).unwrap();
    }
    // the writer filled exactly; the next insert triggered nothing yet
    let (_, waiting, _, _) = store.counts();
    assert_eq!(waiting, 1);
    assert_eq!(store.writer_size(), 0);
    store.insert(&edge(99, 99)).unwrap();
    assert_eq!(store.writer_size(), 64);
}

#[test]
fn sorter_promotes_and_donates() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::create(dir.path(), edge_cfg("buys")).unwrap();
    // reversed timestamps so sorting is observable
    for i in 0..PER_FILE {
        store.insert(&edge((PER_FILE - i) as i64, i)).unwrap();
    }
    assert_eq!(store.counts().1, 1);
    sort_step(&store).unwrap();
    let (w, waiting, readers, spares) = store.counts();
    assert_eq!((w, waiting, readers, spares), (1, 0, 1, 1));

    // reader content is time-ordered and stamps travelled along
    let readers = store.get_readers(i64::MIN, i64::MAX);
    assert_eq!(readers.len(), 1);
    let mut r = readers.into_iter().next().unwrap();
    assert!(r.is_sorted());
    assert_eq!(r.oldest, 1);
    assert_eq!(r.newest, PER_FILE as i64);
    r.open().unwrap();
    let mut last = i64::MIN;
    let mut n = 0u64;
    while r.move_next().is_ok() {
        let page = r.page().to_vec();
        for i in 0..r.page_records() as usize {
            let ts = read_i64(&page[i * 64..], OFF_TMSTMP);
            assert!(ts >= last);
            last = ts;
            n += 1;
        }
    }
    assert_eq!(n, PER_FILE);
}

#[test]
fn sort_with_nothing_waiting_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::create(dir.path(), edge_cfg("buys")).unwrap();
    store.insert(&edge(1, 1)).unwrap();
    sort_step(&store).unwrap();
    let (w, waiting, readers, spares) = store.counts();
    assert_eq!((w, waiting, readers, spares), (1, 0, 0, 0));
    assert_eq!(store.writer_size(), 64);
}

#[test]
fn reopen_reads_every_record_once() {
    let dir = tempfile::tempdir().unwrap();
    let total = 3000u64;
    {
        let store = Store::create(dir.path(), edge_cfg("buys")).unwrap();
        for i in 0..total {
            store.insert(&edge(i as i64, i)).unwrap();
        }
        store.close().unwrap();
    }
    let store = Store::open(dir.path(), edge_cfg("buys")).unwrap();
    let mut seen = std::collections::HashSet::new();
    for mut f in store.get_files(i64::MIN, i64::MAX) {
        f.open().unwrap();
        while f.move_next().is_ok() {
            let page = f.page().to_vec();
            for i in 0..f.page_records() as usize {
                let origin = nowdb::types::read_u64(&page[i * 64..], nowdb::types::OFF_ORIGIN);
                assert!(seen.insert(origin), "record {origin} read twice");
            }
        }
        f.close().unwrap();
    }
    assert_eq!(seen.len() as u64, total);
    store.close().unwrap();
}

#[test]
fn catalog_survives_sort_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = Store::create(dir.path(), edge_cfg("buys")).unwrap();
        for i in 0..PER_FILE + 10 {
            store.insert(&edge(i as i64, i)).unwrap();
        }
        sort_step(&store).unwrap();
        store.close().unwrap();
    }
    let store = Store::open(dir.path(), edge_cfg("buys")).unwrap();
    let (w, waiting, readers, spares) = store.counts();
    assert_eq!((w, waiting, readers, spares), (1, 0, 1, 1));
    assert_eq!(store.writer_size(), 10 * 64);
    // records are still all there
    let mut n = 0u64;
    for mut f in store.get_files(i64::MIN, i64::MAX) {
        f.open().unwrap();
        while f.move_next().is_ok() {
            n += u64::from(f.page_records());
        }
        f.close().unwrap();
    }
    assert_eq!(n, PER_FILE + 10);
}

#[test]
fn period_prunes_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::create(dir.path(), edge_cfg("buys")).unwrap();
    let day = 86_400i64 * 1_000_000_000;
    for i in 0..PER_FILE {
        store.insert(&edge(day + i as i64, i)).unwrap();
    }
    sort_step(&store).unwrap();
    for i in 0..100 {
        store.insert(&edge(2 * day + i, i as u64)).unwrap();
    }
    // day-two window excludes the day-one reader
    assert!(store.get_readers(2 * day, 3 * day - 1).is_empty());
    assert_eq!(store.get_readers(day, 2 * day - 1).len(), 1);
    let files = store.get_files(2 * day, 3 * day - 1);
    assert_eq!(files.len(), 1); // just the writer
}

#[test]
fn drop_files_removes_old_readers() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::create(dir.path(), edge_cfg("buys")).unwrap();
    for i in 0..PER_FILE {
        store.insert(&edge(i as i64, i)).unwrap();
    }
    sort_step(&store).unwrap();
    assert_eq!(store.counts().2, 1);
    let dropped = store.drop_files(PER_FILE as i64 + 1).unwrap();
    assert_eq!(dropped, 1);
    assert_eq!(store.counts().2, 0);
}
