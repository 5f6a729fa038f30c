//! Scenario 5 (SPEC_FULL.md §8): three multi-cluster files A, B, C; delete
//! the middle one and check the others are untouched and the deleted one is
//! really gone.

mod common;

use afatfs::AfatfsError;

#[test]
fn deleting_the_middle_file_leaves_its_siblings_intact() {
    let mut fs = common::mounted_fs();
    let cluster_size = fs.cluster_size() as usize;

    let content_a: Vec<u8> = (0..cluster_size * 2 + 11).map(|i| (i % 251) as u8).collect();
    let content_b: Vec<u8> = (0..cluster_size * 2 + 22).map(|i| (i.wrapping_mul(3) % 251) as u8).collect();
    let content_c: Vec<u8> = (0..cluster_size * 2 + 33).map(|i| (i.wrapping_mul(7) % 251) as u8).collect();

    for (name, content) in [("A.TXT", &content_a), ("B.TXT", &content_b), ("C.TXT", &content_c)] {
        let id = fs.fopen(None, name, "w").unwrap_or_else(|e| panic!("create {name} failed: {e}"));
        common::write_all(&mut fs, id, content);
        common::drain(&mut fs, |fs| fs.fclose(id)).expect("close failed");
    }

    common::drain(&mut fs, |fs| fs.funlink(None, "B.TXT")).expect("funlink B failed");

    match fs.fopen(None, "B.TXT", "r") {
        Err(AfatfsError::NotFound) => {}
        Ok(_) => panic!("B.TXT should no longer exist after funlink"),
        Err(e) => panic!("unexpected error reopening deleted B.TXT: {e}"),
    }

    for (name, expected) in [("A.TXT", &content_a), ("C.TXT", &content_c)] {
        let id = fs.fopen(None, name, "r").unwrap_or_else(|e| panic!("reopen {name} failed: {e}"));
        let mut buf = vec![0u8; expected.len()];
        common::read_exact(&mut fs, id, &mut buf);
        assert_eq!(&buf, expected, "{name} did not read back byte-identical after sibling delete");
        common::drain(&mut fs, |fs| fs.fclose(id)).expect("close failed");
    }
}
