//! Integration tests for the MBOX source, alone and driving a full run into
//! a directory tree.

use assert_fs::prelude::*;
use chrono::{DateTime, Utc};
use predicates::prelude::*;

use mailvault::archive::{Archiver, EngineConfig, RunOptions, RunStatus};
use mailvault::clock::ManualClock;
use mailvault::destination::{FolderHandle, FsStore};
use mailvault::kv::FileKv;
use mailvault::ledger::{LedgerConfig, LedgerStore};
use mailvault::retry::RetryPolicy;
use mailvault::schedule::{Band, ScopedQuery, Window};
use mailvault::source::{FetchService, MboxSource};

const MBOX: &str = "\
From dave@example.com Sat Jun  1 12:00:00 2024
Message-ID: <recent@example.com>
Date: Sat, 01 Jun 2024 12:00:00 +0000
From: dave@example.com
Subject: Too recent

Still fresh.

From billing@example.com Tue Sep 12 09:30:00 2023
Message-ID: <invoice@example.com>
Date: Tue, 12 Sep 2023 09:30:00 +0000
From: Billing <billing@example.com>
To: alice@example.com
Subject: Invoice
X-Gmail-Labels: Inbox,Receipts
MIME-Version: 1.0
Content-Type: multipart/mixed; boundary=\"XYZ\"

--XYZ
Content-Type: text/plain; charset=utf-8

Your invoice is attached.
--XYZ
Content-Type: application/pdf; name=\"invoice.pdf\"
Content-Disposition: attachment; filename=\"invoice.pdf\"
Content-Transfer-Encoding: base64

UERGLURBVEEtMTIz
--XYZ--

From alice@example.com Sun Sep 10 08:00:00 2023
Message-ID: <cafe@example.com>
Date: Sun, 10 Sep 2023 08:00:00 +0000
From: Alice <alice@example.com>
To: bob@example.com
Subject: =?UTF-8?B?Q2Fmw6kgcmVwb3J0?=

Numbers are in.

From carol@example.com Thu Sep 14 10:00:00 2023
From: carol@example.com
Subject: No date header

Dated by the separator line only.
";

fn run_date() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-06-15T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn mid_range(base: &str) -> ScopedQuery {
    ScopedQuery::new(base, &Window::for_band(Band::MidRange), run_date())
}

fn write_mbox(dir: &assert_fs::TempDir) -> std::path::PathBuf {
    let file = dir.child("export.mbox");
    file.write_str(MBOX).unwrap();
    file.path().to_path_buf()
}

#[test]
fn test_catalog_and_window_search() {
    let dir = assert_fs::TempDir::new().unwrap();
    let source = MboxSource::open(write_mbox(&dir)).unwrap();
    assert_eq!(source.len(), 4);

    let records = source.search(&mid_range(""), 0, 10).unwrap();
    let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids.len(), 3);
    assert_eq!(ids[0], "<cafe@example.com>");
    assert_eq!(ids[1], "<invoice@example.com>");
    assert!(ids[2].starts_with("mbox:"));

    assert_eq!(records[0].subject.as_deref(), Some("Café report"));
    assert!(records[0]
        .text_body
        .as_deref()
        .unwrap()
        .contains("Numbers are in."));
    assert_eq!(records[1].labels, ["Inbox", "Receipts"]);
    assert_eq!(records[2].timestamp.as_deref(), Some("Thu Sep 14 10:00:00 2023"));

    let page = source.search(&mid_range(""), 1, 1).unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, "<invoice@example.com>");
}

#[test]
fn test_attachments_load_on_demand() {
    let dir = assert_fs::TempDir::new().unwrap();
    let source = MboxSource::open(write_mbox(&dir)).unwrap();

    let records = source.search(&mid_range("has:attachment"), 0, 10).unwrap();
    assert_eq!(records.len(), 1);
    let invoice = &records[0];
    assert_eq!(invoice.attachments.len(), 1);

    let att = invoice.attachments[0].as_ref().unwrap();
    assert_eq!(att.name.as_deref(), Some("invoice.pdf"));
    assert_eq!(att.mime_type.as_deref(), Some("application/pdf"));
    let bytes = att.content.as_ref().unwrap().materialize().unwrap();
    assert_eq!(bytes, b"PDF-DATA-123");
}

#[test]
fn test_query_terms_filter_catalog() {
    let dir = assert_fs::TempDir::new().unwrap();
    let source = MboxSource::open(write_mbox(&dir)).unwrap();

    let hits = source.search(&mid_range("label:receipts"), 0, 10).unwrap();
    assert_eq!(hits.len(), 1);
    let hits = source.search(&mid_range("from:alice -subject:invoice"), 0, 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "<cafe@example.com>");
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = assert_fs::TempDir::new().unwrap();
    assert!(MboxSource::open(dir.child("nope.mbox").path()).is_err());
}

#[test]
fn test_run_into_directory_tree() {
    let dir = assert_fs::TempDir::new().unwrap();
    let source = MboxSource::open(write_mbox(&dir)).unwrap();
    let archive = dir.child("archive");
    let store = FsStore::open(archive.path()).unwrap();
    let kv = FileKv::open(dir.child("state").path(), 64 * 1024).unwrap();
    let clock = ManualClock::new(run_date());
    let config = EngineConfig {
        anchor: FolderHandle::root().child("Mail Archive"),
        retry: RetryPolicy::none(),
        ..EngineConfig::default()
    };

    let ledger = LedgerStore::open(&kv, LedgerConfig::default()).unwrap();
    let report = Archiver::new(&source, &store, ledger, &clock, config.clone())
        .run_once(&RunOptions::default())
        .unwrap();
    assert_eq!(report.status, RunStatus::Done);
    assert_eq!(report.processed, 3, "{:?}", report.items);
    assert_eq!(report.errors, 0);

    let day = archive.child("Mail Archive/2023/09/12");
    day.assert(predicate::path::is_dir());
    let folders: Vec<_> = std::fs::read_dir(day.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(folders.len(), 1);
    let record_dir = &folders[0];
    let base = record_dir.file_name().unwrap().to_string_lossy().to_string();
    assert!(base.starts_with("Invoice_20230912_093000_"), "{base}");

    let attachment = record_dir.join("attachments").join("invoice.pdf");
    assert_eq!(std::fs::read(&attachment).unwrap(), b"PDF-DATA-123");
    assert!(record_dir.join(format!("{base}.html")).is_file());
    let meta = std::fs::read_to_string(record_dir.join(format!("{base}.json"))).unwrap();
    assert!(predicate::str::contains("\"id\": \"<invoice@example.com>\"").eval(&meta));

    archive
        .child("Mail Archive/2024")
        .assert(predicate::path::missing());
    dir.child("state/ledger.json").assert(predicate::path::is_file());
    dir.child("state/cursor.json").assert(predicate::path::is_file());

    // A second invocation finds everything in the ledger.
    let ledger = LedgerStore::open(&kv, LedgerConfig::default()).unwrap();
    let report = Archiver::new(&source, &store, ledger, &clock, config)
        .run_once(&RunOptions::default())
        .unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(report.skipped, 3);
}
