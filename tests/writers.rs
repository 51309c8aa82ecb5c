mod common;

use common::*;
use rmtrace::format::{TraceFile, TraceFormat};
use rmtrace::writer::{container, legacy};
use rmtrace::{CancelToken, DataSet, Error};
use tempfile::tempdir;

#[test]
fn legacy_snapshot_round_trips() {
    let dir = tempdir().expect("tempdir");
    let dataset = build(&legacy_trace(&aliasing_events(0)));
    let snapshot = dataset
        .snapshot_named("mapped", 50, &CancelToken::new())
        .expect("snapshot");

    let path = dir.path().join("mapped.rmts");
    legacy::write(&path, &snapshot).expect("write");
    let image = legacy::read(&path).expect("read");
    assert_eq!(image, snapshot.image());
    assert_eq!(image.digest(), snapshot.digest());
    assert_eq!(image.resources.len(), 2);
    assert_eq!(image.page_runs.len(), 2);

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .expect("read dir")
        .map(|entry| entry.expect("entry").file_name())
        .collect();
    assert_eq!(leftovers, vec![std::ffi::OsString::from("mapped.rmts")]);
}

#[test]
fn corrupted_legacy_snapshot_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let dataset = build(&legacy_trace(&aliasing_events(0)));
    let snapshot = dataset.snapshot(50).expect("snapshot");
    let path = dir.path().join("snap.rmts");
    legacy::write(&path, &snapshot).expect("write");

    let mut bytes = std::fs::read(&path).expect("read bytes");
    let last = bytes.len() - 1;
    bytes[last] ^= 0x40;
    std::fs::write(&path, &bytes).expect("rewrite");
    assert!(matches!(legacy::read(&path), Err(Error::MalformedTrace(_))));
}

#[test]
fn container_snapshots_append_and_reopen() {
    let dir = tempdir().expect("tempdir");
    let source_path = dir.path().join("source.rmt");
    legacy_trace(&aliasing_events(0))
        .write(&source_path)
        .expect("write source");

    let mut dataset = DataSet::open(&source_path).expect("open");
    dataset
        .build(&mut rmtrace::NoProgress, &CancelToken::new())
        .expect("build");
    let early = dataset
        .snapshot_named("bound", 35, &CancelToken::new())
        .expect("early");
    let late = dataset
        .snapshot_named("mapped", 50, &CancelToken::new())
        .expect("late");

    // A legacy source is transcoded into a container.
    let first_path = dir.path().join("with-one.rdf");
    let ordinal = container::write(&first_path, dataset.trace(), &early).expect("first write");
    assert_eq!(ordinal, 0);
    let first = TraceFile::open(&first_path).expect("reopen first");
    assert_eq!(first.format(), TraceFormat::Container);
    assert_eq!(container::snapshot_count(&first), 1);

    let second_path = dir.path().join("with-two.rdf");
    let ordinal = container::write(&second_path, &first, &late).expect("second write");
    assert_eq!(ordinal, 1);

    let second = TraceFile::open(&second_path).expect("reopen second");
    let images = container::read_all(&second).expect("read all");
    assert_eq!(images, vec![early.image(), late.image()]);
    assert_eq!(second.snapshot_infos[1].name, "mapped");
    assert_eq!(second.snapshot_infos[1].digest, late.digest());

    // The container still replays to the same state as the source.
    let mut reopened = DataSet::open(&second_path).expect("open container");
    reopened
        .build(&mut rmtrace::NoProgress, &CancelToken::new())
        .expect("rebuild");
    assert_eq!(
        reopened
            .snapshot_named("mapped", 50, &CancelToken::new())
            .expect("snapshot")
            .digest(),
        late.digest()
    );
    let names: Vec<_> = reopened
        .snapshot_points()
        .iter()
        .map(|point| point.name.as_str())
        .collect();
    assert_eq!(names, vec!["bound", "mapped"]);
}

#[test]
fn missing_container_snapshot_is_malformed() {
    let trace = TraceFile::from_bytes(legacy_trace(&aliasing_events(0)).build()).expect("trace");
    assert!(matches!(
        container::read(&trace, 0),
        Err(Error::MalformedTrace(_))
    ));
}
