//! Scenario 2 (SPEC_FULL.md §8): `mkdir`+`chdir` into a subdirectory and
//! keep creating empty `LOGxxxxx.TXT` files there — unlike the fixed-size
//! root, a subdirectory must grow its own cluster chain on demand, so this
//! must be able to create far more entries than fit in a single cluster.

mod common;

use afatfs::{AfatfsError, FindNextOutcome};

#[test]
fn subdirectory_grows_past_one_cluster_then_enumerate_matches_created_count() {
    let mut fs = common::mounted_fs();

    let logs = fs.mkdir(None, "LOGS").expect("mkdir LOGS failed");
    fs.chdir(Some(logs)).expect("chdir into LOGS failed");

    // One data cluster here holds 16 entries; run well past that so the
    // directory is forced to extend its chain at least once.
    let target = 64usize;
    let mut created = 0usize;
    loop {
        if created >= target {
            break;
        }
        let name = format!("LOG{created:05}.TXT");
        match fs.fopen(None, &name, "a") {
            Ok(id) => {
                let _ = common::drain(&mut fs, |fs| fs.fclose(id));
                created += 1;
            }
            Err(AfatfsError::DirectoryFull) => break,
            Err(e) => panic!("unexpected error creating {name}: {e}"),
        }
    }

    assert_eq!(created, target, "subdirectory should have extended its chain to fit all entries");

    let mut finder = fs.find_first(None);
    let mut enumerated = 0usize;
    let mut seen_log_files = 0usize;
    loop {
        match common::drain(&mut fs, |fs| fs.find_next(&mut finder)) {
            Ok(FindNextOutcome::Entry(_, entry)) => {
                enumerated += 1;
                if entry.name.starts_with(b"LOG") {
                    seen_log_files += 1;
                }
            }
            Ok(FindNextOutcome::EndOfDirectory) => break,
            Err(e) => panic!("enumeration failed: {e}"),
        }
    }

    assert!(enumerated >= created, "enumerated {enumerated} but created {created}");
    assert_eq!(seen_log_files, created);
}
