use nowdb::session::{Library, Session, report_of, rows_of, status_of};
use nowdb::types::Value;
use std::io::Write;

fn write_products_csv(dir: &std::path::Path, n: u64) -> std::path::PathBuf {
    let path = dir.join("p.csv");
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "prod_key,prod_desc").unwrap();
    for i in 0..n {
        writeln!(f, "{i},product number {i}").unwrap();
    }
    path
}

fn ok(frames: &[u8]) {
    let (code, details) = status_of(frames).expect("status frame");
    assert_eq!(code, 0, "statement failed: {details}");
}

#[test]
fn scope_layout_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let lib = Library::new(dir.path(), 2).unwrap();
    let mut s = Session::new(&lib);
    ok(&s.handle("create database d"));
    let base = dir.path().join("d");
    assert!(base.join("catalog").exists());
    assert!(base.join("model").join("catalog").exists());
    assert!(base.join("text").join("dict").exists());
    assert!(base.join("vertex").join("catalog").exists());
    assert!(base.join("ipc").exists());
    assert!(base.join("procman").exists());
    lib.close().unwrap();
}

#[test]
fn load_products_and_count() {
    let dir = tempfile::tempdir().unwrap();
    let csv = write_products_csv(dir.path(), 100);
    let lib = Library::new(&dir.path().join("db"), 2).unwrap();
    let mut s = Session::new(&lib);
    ok(&s.handle("create database d"));
    ok(&s.handle("use d"));
    ok(&s.handle("create type product (prod_key uint primary key, prod_desc text)"));

    let frames = s.handle(&format!("load '{}' into product use header", csv.display()));
    let (affected, errors, _rt) = report_of(&frames).expect("report frame");
    assert_eq!((affected, errors), (100, 0));

    let frames = s.handle("select count(*) from product");
    let rows = rows_of(&frames);
    assert_eq!(rows, vec![vec![Value::UInt(100)]]);
    lib.close().unwrap();
}

#[test]
fn vertex_rows_reassemble_across_properties() {
    let dir = tempfile::tempdir().unwrap();
    let lib = Library::new(dir.path(), 2).unwrap();
    let mut s = Session::new(&lib);
    ok(&s.handle("create database d"));
    ok(&s.handle("use d"));
    ok(&s.handle(
        "create type product (prod_key uint primary key, prod_desc text, prod_price float)",
    ));
    let frames =
        s.handle("insert into product (prod_key, prod_desc, prod_price) values (42, 'wrench', 9.5)");
    assert!(report_of(&frames).is_some());
    s.handle("insert into product (prod_key, prod_desc, prod_price) values (43, 'hammer', 3.25)");

    let frames = s.handle("select prod_desc, prod_price from product where prod_key = 42");
    let rows = rows_of(&frames);
    assert_eq!(rows, vec![vec![Value::Text("wrench".into()), Value::Float(9.5)]]);

    // text primary keys resolve through the dictionary
    ok(&s.handle("create type city (city_name text primary key, population uint)"));
    s.handle("insert into city (city_name, population) values ('lisbon', 500000)");
    let rows = rows_of(&s.handle("select population from city where city_name = 'lisbon'"));
    assert_eq!(rows, vec![vec![Value::UInt(500_000)]]);
    lib.close().unwrap();
}

#[test]
fn close_and_reopen_preserves_results() {
    let dir = tempfile::tempdir().unwrap();
    let csv = write_products_csv(dir.path(), 100);
    let base = dir.path().join("db");
    {
        let lib = Library::new(&base, 2).unwrap();
        let mut s = Session::new(&lib);
        ok(&s.handle("create database d"));
        ok(&s.handle("use d"));
        ok(&s.handle("create type product (prod_key uint primary key, prod_desc text)"));
        s.handle(&format!("load '{}' into product use header", csv.display()));
        lib.close().unwrap();
    }
    let lib = Library::new(&base, 2).unwrap();
    let mut s = Session::new(&lib);
    ok(&s.handle("use d"));
    let rows = rows_of(&s.handle("select count(*) from product"));
    assert_eq!(rows, vec![vec![Value::UInt(100)]]);
    let rows = rows_of(&s.handle("select prod_desc from product where prod_key = 7"));
    assert_eq!(rows, vec![vec![Value::Text("product number 7".into())]]);
    lib.close().unwrap();
}

#[test]
fn statement_errors_become_status_frames() {
    let dir = tempfile::tempdir().unwrap();
    let lib = Library::new(dir.path(), 2).unwrap();
    let mut s = Session::new(&lib);
    // parse error
    let (code, _) = status_of(&s.handle("frobnicate the database")).unwrap();
    assert_ne!(code, 0);
    // no scope in use
    let (code, details) = status_of(&s.handle("select * from buys")).unwrap();
    assert_ne!(code, 0);
    assert!(details.contains("no database in use"));
    // unknown target
    ok(&s.handle("create database d"));
    ok(&s.handle("use d"));
    let (code, _) = status_of(&s.handle("select * from nothere")).unwrap();
    assert_ne!(code, 0);
    lib.close().unwrap();
}

#[test]
fn procedures_are_catalogued_but_hosted_externally() {
    let dir = tempfile::tempdir().unwrap();
    let lib = Library::new(dir.path(), 2).unwrap();
    let mut s = Session::new(&lib);
    ok(&s.handle("create database d"));
    ok(&s.handle("use d"));
    ok(&s.handle("create procedure nightly language lua as 'etl/nightly.lua'"));
    let (code, details) = status_of(&s.handle("exec nightly")).unwrap();
    assert_ne!(code, 0);
    assert!(details.contains("not supported"));
    ok(&s.handle("drop procedure nightly"));
    lib.close().unwrap();
}
