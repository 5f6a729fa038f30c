//! Scenario 4 (SPEC_FULL.md §8): repeatedly create and delete the same
//! file, in both contiguous ("as") and ordinary ("a") append modes, and
//! check that `funlink` actually reclaims the clusters it frees rather than
//! leaking them toward `is_full()`.
//!
//! Contiguous-mode files draw whole superclusters from the freefile and
//! that reservation never shrinks back (§4.5 — the freefile is a one-way
//! donor for the life of the mount), so this test keeps "as" rounds rare
//! enough to stay well inside the freefile's supercluster budget on this
//! suite's scaled-down volume; the bulk of the cycling exercises the
//! reusable, non-contiguous ("a") allocation path instead.

mod common;

#[test]
fn create_and_delete_cycle_never_fills_the_volume() {
    let mut fs = common::mounted_fs();

    let cluster_size = fs.cluster_size() as usize;
    let payload = vec![0xABu8; cluster_size * 4 + 37];

    for round in 0..120 {
        let mode = if round % 12 == 0 { "as" } else { "a" };
        let id = fs.fopen(None, "TEST.TXT", mode).unwrap_or_else(|e| {
            panic!("round {round} ({mode}): fopen failed: {e} (is_full={})", fs.is_full())
        });
        common::write_all(&mut fs, id, &payload);
        common::drain(&mut fs, |fs| fs.fclose(id)).expect("close failed");

        assert!(!fs.is_full(), "round {round}: volume reported full after only {round} create/delete cycles");

        common::drain(&mut fs, |fs| fs.funlink(None, "TEST.TXT")).unwrap_or_else(|e| {
            panic!("round {round}: funlink failed: {e}")
        });

        assert!(!fs.is_full(), "round {round}: volume reported full right after funlink reclaimed it");
    }
}
