use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use dedupvault::filter::FilterSet;
use dedupvault::manifest::{ManifestLog, ManifestRecord, WHEN_RUNNING};
use dedupvault::store::ObjectStore;
use dedupvault::types::{BackupStats, FileKind, RunStatus, SetId};
use dedupvault::walker::{Instance, Source};
use filetime::FileTime;
use tempfile::{TempDir, tempdir};

struct TestBed {
    dir: TempDir,
    store: ObjectStore,
    backups: PathBuf,
}

impl TestBed {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let store = ObjectStore::open(dir.path().join("files.db"));
        let backups = dir.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        Self { dir, store, backups }
    }

    fn src(&self) -> PathBuf {
        self.dir.path().join("src")
    }

    fn run(&self, source: &Source) -> (BackupStats, Vec<ManifestRecord>) {
        let set = SetId::unowned("set1");
        let mut log = ManifestLog::new(&self.backups, &set);
        let last = log.last_backup().unwrap();
        log.create(WHEN_RUNNING).unwrap();
        let mut stats = BackupStats::default();
        {
            let mut inst = Instance { log: &mut log, store: &self.store, stats: &mut stats };
            source.backup_to(&mut inst, last.as_ref()).unwrap();
        }
        log.finish(RunStatus::Ok, &stats).unwrap();
        let when = log.complete(&Utc::now()).unwrap();
        let records =
            log.iter(&when).unwrap().collect::<Result<Vec<_>, _>>().unwrap();
        (stats, records)
    }
}

fn file_paths(records: &[ManifestRecord]) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| match r {
            ManifestRecord::Entry(e) if e.kind == FileKind::File => Some(e.path.clone()),
            _ => None,
        })
        .collect()
}

fn dir_paths(records: &[ManifestRecord]) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| match r {
            ManifestRecord::Entry(e) if e.kind == FileKind::Dir => Some(e.path.clone()),
            _ => None,
        })
        .collect()
}

fn file_hash(records: &[ManifestRecord], path: &str) -> String {
    records
        .iter()
        .find_map(|r| match r {
            ManifestRecord::Entry(e) if e.kind == FileKind::File && e.path == path => {
                e.hash.clone()
            }
            _ => None,
        })
        .unwrap()
}

#[test]
fn first_backup_records_and_stores_every_file() {
    let bed = TestBed::new();
    fs::create_dir_all(bed.src().join("docs")).unwrap();
    fs::write(bed.src().join("a.txt"), b"hello\n").unwrap();
    fs::write(bed.src().join("docs/b.txt"), b"world\n").unwrap();
    let (stats, records) = bed.run(&Source::new(bed.src()));
    assert_eq!(stats.files, 2);
    assert_eq!(stats.bytes, 12);
    assert_eq!(stats.backed_up.files, 2);
    assert_eq!(stats.skipped, 0);
    let mut files = file_paths(&records);
    files.sort();
    assert_eq!(files, ["a.txt", "docs/b.txt"]);
    assert!(dir_paths(&records).contains(&"docs".to_string()));
    // The source line precedes every entry.
    assert!(matches!(records[1], ManifestRecord::Source { .. }));
}

#[test]
fn unchanged_files_reuse_the_recorded_hash_without_rehashing() {
    let bed = TestBed::new();
    fs::create_dir_all(bed.src()).unwrap();
    let file = bed.src().join("a.txt");
    fs::write(&file, b"hello\n").unwrap();
    let mtime = FileTime::from_unix_time(1_700_000_000, 0);
    filetime::set_file_mtime(&file, mtime).unwrap();
    let (_, first) = bed.run(&Source::new(bed.src()));
    let original_hash = file_hash(&first, "a.txt");

    // Rewrite with different content but identical size and mtime. A reused
    // hash proves the walker trusted the previous run instead of reading.
    fs::write(&file, b"HELLO\n").unwrap();
    filetime::set_file_mtime(&file, mtime).unwrap();
    let (stats, second) = bed.run(&Source::new(bed.src()));
    assert_eq!(file_hash(&second, "a.txt"), original_hash);
    assert_eq!(stats.files, 1);
    assert_eq!(stats.backed_up.files, 0);
}

#[test]
fn check_hash_forces_a_rehash_of_matching_files() {
    let bed = TestBed::new();
    fs::create_dir_all(bed.src()).unwrap();
    let file = bed.src().join("a.txt");
    fs::write(&file, b"hello\n").unwrap();
    let mtime = FileTime::from_unix_time(1_700_000_000, 0);
    filetime::set_file_mtime(&file, mtime).unwrap();
    let (_, first) = bed.run(&Source::new(bed.src()));
    let original_hash = file_hash(&first, "a.txt");

    fs::write(&file, b"HELLO\n").unwrap();
    filetime::set_file_mtime(&file, mtime).unwrap();
    let mut source = Source::new(bed.src());
    source.check_hash = true;
    let (stats, second) = bed.run(&source);
    assert_ne!(file_hash(&second, "a.txt"), original_hash);
    assert_eq!(stats.backed_up.files, 1);
}

#[test]
fn modified_files_are_stored_again() {
    let bed = TestBed::new();
    fs::create_dir_all(bed.src()).unwrap();
    let file = bed.src().join("a.txt");
    fs::write(&file, b"hello\n").unwrap();
    let (_, first) = bed.run(&Source::new(bed.src()));
    fs::write(&file, b"changed contents\n").unwrap();
    let (stats, second) = bed.run(&Source::new(bed.src()));
    assert_ne!(file_hash(&second, "a.txt"), file_hash(&first, "a.txt"));
    assert_eq!(stats.backed_up.files, 1);
}

#[test]
fn excluded_files_are_not_recorded() {
    let bed = TestBed::new();
    fs::create_dir_all(bed.src()).unwrap();
    fs::write(bed.src().join("keep.txt"), b"keep").unwrap();
    fs::write(bed.src().join("noise.log"), b"noise").unwrap();
    let mut source = Source::new(bed.src());
    source.filters = FilterSet::parse(&["-*.log"]).unwrap();
    let (stats, records) = bed.run(&source);
    assert_eq!(file_paths(&records), ["keep.txt"]);
    assert_eq!(stats.files, 1);
}

#[test]
fn deepscan_reincludes_descendants_of_excluded_directories() {
    let bed = TestBed::new();
    fs::create_dir_all(bed.src().join("skip/keep")).unwrap();
    fs::write(bed.src().join("skip/keep/x"), b"payload").unwrap();
    fs::write(bed.src().join("skip/dropme"), b"dropped").unwrap();
    let mut source = Source::new(bed.src());
    source.filters = FilterSet::parse(&["-**/skip", "+**/skip/keep"]).unwrap();
    source.deepscan = true;
    let (_, records) = bed.run(&source);
    assert_eq!(file_paths(&records), ["skip/keep/x"]);
    let dirs = dir_paths(&records);
    assert!(dirs.contains(&"skip/keep".to_string()));
    assert!(!dirs.contains(&"skip".to_string()));
}

#[test]
fn without_deepscan_excluded_subtrees_are_pruned() {
    let bed = TestBed::new();
    fs::create_dir_all(bed.src().join("skip/keep")).unwrap();
    fs::write(bed.src().join("skip/keep/x"), b"payload").unwrap();
    let mut source = Source::new(bed.src());
    source.filters = FilterSet::parse(&["-**/skip", "+**/skip/keep"]).unwrap();
    let (stats, records) = bed.run(&source);
    assert!(file_paths(&records).is_empty());
    assert_eq!(stats.files, 0);
}

#[cfg(unix)]
#[test]
fn symlinks_are_skipped_without_a_record() {
    let bed = TestBed::new();
    fs::create_dir_all(bed.src()).unwrap();
    fs::write(bed.src().join("real.txt"), b"real").unwrap();
    std::os::unix::fs::symlink(bed.src().join("real.txt"), bed.src().join("link.txt")).unwrap();
    let (stats, records) = bed.run(&Source::new(bed.src()));
    assert_eq!(file_paths(&records), ["real.txt"]);
    assert_eq!(stats.files, 1);
}

#[test]
fn configured_subdirs_restrict_the_walk() {
    let bed = TestBed::new();
    fs::create_dir_all(bed.src().join("sub1")).unwrap();
    fs::create_dir_all(bed.src().join("sub2")).unwrap();
    fs::write(bed.src().join("sub1/in.txt"), b"in").unwrap();
    fs::write(bed.src().join("sub2/out.txt"), b"out").unwrap();
    fs::write(bed.src().join("top.txt"), b"top").unwrap();
    let mut source = Source::new(bed.src());
    source.subdirs = vec![PathBuf::from("sub1")];
    let (_, records) = bed.run(&source);
    assert_eq!(file_paths(&records), ["sub1/in.txt"]);
    assert_eq!(dir_paths(&records), ["sub1"]);
}
