use std::fs;
use std::path::PathBuf;

use dedupvault::errors::EngineError;
use dedupvault::filter::FilterSet;
use dedupvault::target::Target;
use dedupvault::target::ops::{ListOptions, RestoreOptions, VerifyStatus};
use dedupvault::types::{RunStatus, SetId};
use dedupvault::walker::Source;
use dedupvault::{Vault, store::ObjectKey};
use filetime::FileTime;
use tempfile::{TempDir, tempdir};

const HELLO_SHA256: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

struct Fixture {
    dir: TempDir,
    target: Target,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let target = Target::init(dir.path().join("target")).unwrap();
        Self { dir, target }
    }

    fn src(&self) -> PathBuf {
        self.dir.path().join("src")
    }

    fn write_source_file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.src().join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }
}

#[test]
fn init_writes_config_and_layout() {
    let fx = Fixture::new();
    let root = fx.target.root();
    assert!(root.join("files.db").is_dir());
    assert!(root.join("backups").is_dir());
    let config: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(root.join("config.json")).unwrap()).unwrap();
    assert_eq!(config["version"], 1);
    assert_eq!(config["fstype"], "hash-v5");
    assert!(config["saved"].is_string());
}

#[test]
fn connect_verifies_the_filesystem_type() {
    let fx = Fixture::new();
    Target::connect(fx.target.root()).unwrap();

    let other = tempdir().unwrap();
    let err = Target::connect(other.path()).unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)), "got {err:?}");

    fs::write(
        other.path().join("config.json"),
        r#"{"version":1,"fstype":"hash-v9","saved":"2024-01-01T00:00:00.000Z"}"#,
    )
    .unwrap();
    let err = Target::connect(other.path()).unwrap_err();
    assert!(matches!(err, EngineError::UnknownFilesystem(f) if f == "hash-v9"));
}

#[test]
fn first_backup_of_one_file_lands_object_and_log() {
    let fx = Fixture::new();
    fx.write_source_file("a.txt", b"hello\n");
    let set = SetId::unowned("set1");
    let stats = fx.target.backup(&set, &[Source::new(fx.src())]).unwrap();
    assert_eq!(stats.files, 1);
    assert_eq!(stats.backed_up.files, 1);

    let object = fx
        .target
        .root()
        .join("files.db/58/91")
        .join(format!("{HELLO_SHA256}.6"));
    assert!(object.is_file());

    let runs = fx.target.all_manifests().unwrap();
    assert_eq!(runs.len(), 1);
    let text = fs::read_to_string(&runs[0].path).unwrap();
    assert!(text.starts_with("V2 type uid:gid:mode ctime mtime - size hash 0 path\n"));
    assert!(text.contains(&format!("SOURCE {}\n", fx.src().display())));
    assert!(text.contains(&format!(" 6 {HELLO_SHA256} 0 \"a.txt\"\n")));
    assert!(text.lines().last().unwrap().starts_with("V2 STATUS OK {"));
}

#[test]
fn second_backup_of_unchanged_tree_stores_nothing_new() {
    let fx = Fixture::new();
    let file = fx.write_source_file("a.txt", b"hello\n");
    filetime::set_file_mtime(&file, FileTime::from_unix_time(1_700_000_000, 0)).unwrap();
    let set = SetId::unowned("set1");
    fx.target.backup(&set, &[Source::new(fx.src())]).unwrap();
    let stats = fx.target.backup(&set, &[Source::new(fx.src())]).unwrap();
    assert_eq!(stats.files, 1);
    assert_eq!(stats.backed_up.files, 0);
    assert_eq!(fx.target.all_manifests().unwrap().len(), 2);
}

#[test]
fn restore_reproduces_contents_mode_and_mtime() {
    let fx = Fixture::new();
    let file = fx.write_source_file("a.txt", b"hello\n");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&file, fs::Permissions::from_mode(0o644)).unwrap();
    }
    let mtime = FileTime::from_unix_time(1_700_000_000, 0);
    filetime::set_file_mtime(&file, mtime).unwrap();
    let set = SetId::unowned("set1");
    fx.target.backup(&set, &[Source::new(fx.src())]).unwrap();

    let out = fx.dir.path().join("dst");
    let opts = RestoreOptions { set, when: None, output: Some(out.clone()) };
    let stats = fx.target.restore(&opts).unwrap();
    assert_eq!(stats.files, 1);

    let restored = out.join("a.txt");
    assert_eq!(fs::read(&restored).unwrap(), b"hello\n");
    let meta = fs::metadata(&restored).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(meta.permissions().mode() & 0o7777, 0o644);
    }
    assert_eq!(FileTime::from_last_modification_time(&meta), mtime);
}

#[test]
fn restore_skips_existing_matching_files_but_replays_metadata() {
    let fx = Fixture::new();
    let file = fx.write_source_file("a.txt", b"hello\n");
    let mtime = FileTime::from_unix_time(1_700_000_000, 0);
    filetime::set_file_mtime(&file, mtime).unwrap();
    let set = SetId::unowned("set1");
    fx.target.backup(&set, &[Source::new(fx.src())]).unwrap();

    let out = fx.dir.path().join("dst");
    fs::create_dir_all(&out).unwrap();
    fs::write(out.join("a.txt"), b"hello\n").unwrap();
    let opts = RestoreOptions { set, when: None, output: Some(out.clone()) };
    let stats = fx.target.restore(&opts).unwrap();
    assert_eq!(stats.files, 0);
    assert_eq!(stats.skipped, 1);
    let meta = fs::metadata(out.join("a.txt")).unwrap();
    assert_eq!(FileTime::from_last_modification_time(&meta), mtime);
}

#[test]
fn restore_rebuilds_into_the_recorded_source_when_no_output_is_given() {
    let fx = Fixture::new();
    fx.write_source_file("deep/nested/c.txt", b"payload");
    let set = SetId::unowned("set1");
    fx.target.backup(&set, &[Source::new(fx.src())]).unwrap();
    fs::remove_dir_all(fx.src()).unwrap();
    let opts = RestoreOptions { set, when: None, output: None };
    let stats = fx.target.restore(&opts).unwrap();
    assert_eq!(stats.files, 1);
    assert_eq!(fs::read(fx.src().join("deep/nested/c.txt")).unwrap(), b"payload");
}

#[test]
fn verify_reports_ok_changed_and_deleted() {
    let fx = Fixture::new();
    fx.write_source_file("good.txt", b"good contents\n");
    fx.write_source_file("bad.txt", b"bad contents\n");
    fx.write_source_file("gone.txt", b"gone contents\n");
    let set = SetId::unowned("set1");
    fx.target.backup(&set, &[Source::new(fx.src())]).unwrap();

    // Damage bad.txt's object, remove gone.txt's object entirely.
    let bad_digest =
        dedupvault::hashing::hash_file(&fx.src().join("bad.txt"), &Default::default())
            .unwrap()
            .digest;
    let gone_digest =
        dedupvault::hashing::hash_file(&fx.src().join("gone.txt"), &Default::default())
            .unwrap()
            .digest;
    fs::write(fx.target.store().path_of(&ObjectKey::new(bad_digest, 13)), b"junk").unwrap();
    fs::remove_file(fx.target.store().path_of(&ObjectKey::new(gone_digest, 14))).unwrap();

    let outcomes = fx.target.verify(&set, "current", false).unwrap();
    let by_path = |p: &str| outcomes.iter().find(|o| o.path == p).unwrap();
    assert_eq!(by_path("good.txt").status, VerifyStatus::Ok);
    assert_eq!(by_path("bad.txt").status, VerifyStatus::Changed);
    assert_eq!(by_path("gone.txt").status, VerifyStatus::Deleted);
}

#[test]
fn verify_compare_checks_against_the_source_tree() {
    let fx = Fixture::new();
    let file = fx.write_source_file("a.txt", b"original\n");
    let set = SetId::unowned("set1");
    fx.target.backup(&set, &[Source::new(fx.src())]).unwrap();

    let outcomes = fx.target.verify(&set, "current", true).unwrap();
    assert_eq!(outcomes[0].status, VerifyStatus::Ok);

    fs::write(&file, b"modified\n").unwrap();
    let outcomes = fx.target.verify(&set, "current", true).unwrap();
    assert_eq!(outcomes[0].status, VerifyStatus::Changed);

    fs::remove_file(&file).unwrap();
    let outcomes = fx.target.verify(&set, "current", true).unwrap();
    assert_eq!(outcomes[0].status, VerifyStatus::Deleted);
}

#[test]
fn fsck_reports_a_damaged_object() {
    let fx = Fixture::new();
    fx.write_source_file("a.txt", b"hello\n");
    let set = SetId::unowned("set1");
    fx.target.backup(&set, &[Source::new(fx.src())]).unwrap();
    fs::write(
        fx.target.store().path_of(&ObjectKey::new(HELLO_SHA256, 6)),
        b"",
    )
    .unwrap();
    let report = fx.target.fsck().unwrap();
    assert_eq!(report.total, 1);
    assert_eq!(report.verified, 0);
    assert_eq!(report.damaged, 1);
    assert_eq!(report.orphaned, 0);
    assert_eq!(report.missing, 0);
}

#[test]
fn fsck_reports_missing_objects() {
    let fx = Fixture::new();
    fx.write_source_file("a.txt", b"hello\n");
    let set = SetId::unowned("set1");
    fx.target.backup(&set, &[Source::new(fx.src())]).unwrap();
    fs::remove_file(fx.target.store().path_of(&ObjectKey::new(HELLO_SHA256, 6))).unwrap();
    let report = fx.target.fsck().unwrap();
    assert_eq!(report.total, 0);
    assert_eq!(report.missing, 1);
}

#[test]
fn clean_removes_orphans_and_prunes_empty_directories() {
    let fx = Fixture::new();
    fx.write_source_file("a.txt", b"hello\n");
    let set = SetId::unowned("set1");
    fx.target.backup(&set, &[Source::new(fx.src())]).unwrap();

    let spurious_dir = fx.target.root().join("files.db/ff/ff");
    fs::create_dir_all(&spurious_dir).unwrap();
    let spurious = spurious_dir.join(format!("{}.1", "f".repeat(64)));
    fs::write(&spurious, b"junk").unwrap();

    let report = fx.target.clean().unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.pruned_dirs, 2);
    assert!(!spurious.exists());
    assert!(!fx.target.root().join("files.db/ff").exists());
    assert!(fx.target.root().join("files.db").is_dir());
    // The referenced object survives.
    assert!(fx.target.store().exists(&ObjectKey::new(HELLO_SHA256, 6)));

    // Live-set containment: everything still on disk is referenced.
    let report = fx.target.fsck().unwrap();
    assert_eq!(report.orphaned, 0);
}

#[test]
fn fsck_and_clean_refuse_while_a_run_is_in_progress() {
    let fx = Fixture::new();
    fx.write_source_file("a.txt", b"hello\n");
    let set = SetId::unowned("set1");
    fx.target.backup(&set, &[Source::new(fx.src())]).unwrap();
    fs::write(fx.target.backups_root().join("set1.running"), b"V2 header\n").unwrap();
    assert!(matches!(fx.target.fsck(), Err(EngineError::RunningRunConflict(_))));
    assert!(matches!(fx.target.clean(), Err(EngineError::RunningRunConflict(_))));
}

#[test]
fn dedup_shares_objects_across_sets_and_users() {
    let fx = Fixture::new();
    fx.write_source_file("a.txt", b"hello\n");
    fx.target
        .backup(&SetId::unowned("set1"), &[Source::new(fx.src())])
        .unwrap();
    let stats = fx
        .target
        .backup(&SetId::new("alice", "docs"), &[Source::new(fx.src())])
        .unwrap();
    assert_eq!(stats.backed_up.files, 0, "object is shared across sets");
    assert!(fx
        .target
        .backups_root()
        .join("alice")
        .join("docs.current")
        .is_file());
}

#[test]
fn list_summarises_finalised_runs() {
    let fx = Fixture::new();
    fx.write_source_file("a.txt", b"hello\n");
    let set = SetId::unowned("set1");
    fx.target.backup(&set, &[Source::new(fx.src())]).unwrap();
    fx.target.backup(&SetId::new("alice", "docs"), &[Source::new(fx.src())]).unwrap();

    let all = fx.target.list(&ListOptions::default()).unwrap();
    assert_eq!(all.len(), 2);
    let run = all.iter().find(|r| r.setname == "set1").unwrap();
    assert_eq!(run.status, Some(RunStatus::Ok));
    assert_eq!(run.stats.as_ref().unwrap().files, 1);
    assert!(run.time.is_some());

    let alice_only = fx
        .target
        .list(&ListOptions { userid: Some("alice".into()), ..Default::default() })
        .unwrap();
    assert_eq!(alice_only.len(), 1);
    assert_eq!(alice_only[0].setname, "docs");
}

#[test]
fn vault_facade_requires_a_connection() {
    let vault = Vault::new();
    assert!(matches!(vault.fsck(), Err(EngineError::LocationUnset)));

    let dir = tempdir().unwrap();
    let mut vault = Vault::new();
    vault.init(&dir.path().join("target")).unwrap();
    let report = vault.fsck().unwrap();
    assert_eq!(report.total, 0);
}
