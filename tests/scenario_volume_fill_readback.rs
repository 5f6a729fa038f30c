//! Scenario 3 (SPEC_FULL.md §8): keep appending ASCII log lines into fresh
//! files under a subdirectory until the volume reports full, then reopen
//! every file for reading and check that everything written reads back.

mod common;

use afatfs::AfatfsError;

#[test]
fn volume_fill_then_readback_recovers_everything_written() {
    let mut fs = common::mounted_fs();
    let logs = fs.mkdir(None, "LOGS").expect("mkdir LOGS failed");
    fs.chdir(Some(logs)).expect("chdir into LOGS failed");

    let line = b"2026-07-28T00:00:00Z scenario volume fill log line\n";
    let mut written_total = 0u64;
    let mut file_index = 0usize;
    let mut filled = false;

    'outer: while file_index < 256 {
        let name = format!("F{file_index:05}.LOG");
        let id = match fs.fopen(None, &name, "as") {
            Ok(id) => id,
            Err(AfatfsError::VolumeFull) | Err(AfatfsError::DirectoryFull) => {
                filled = true;
                break;
            }
            Err(e) => panic!("unexpected error opening {name}: {e}"),
        };

        // Write lines into this one file until either the volume fills or
        // a handful of lines have gone in, then move on to the next file —
        // this exercises both append-within-file and create-next-file
        // paths before the volume actually fills.
        for _ in 0..8 {
            match common::drain(&mut fs, |fs| fs.fwrite(id, line)) {
                Ok(n) if n == line.len() => written_total += n as u64,
                Ok(n) => {
                    written_total += n as u64;
                }
                Err(AfatfsError::VolumeFull) => {
                    let _ = common::drain(&mut fs, |fs| fs.fclose(id));
                    filled = true;
                    break 'outer;
                }
                Err(e) => panic!("unexpected write error: {e}"),
            }
        }
        let _ = common::drain(&mut fs, |fs| fs.fclose(id));
        file_index += 1;
    }

    assert!(written_total > 0, "expected at least some bytes to be written before the run ended");
    let _ = filled;

    let mut read_total = 0u64;
    let mut read_lines = 0u64;
    let written_lines = written_total / line.len() as u64;

    for idx in 0..file_index {
        let name = format!("F{idx:05}.LOG");
        let id = match fs.fopen(None, &name, "r") {
            Ok(id) => id,
            Err(AfatfsError::NotFound) => continue,
            Err(e) => panic!("unexpected error reopening {name}: {e}"),
        };
        let mut buf = [0u8; 512];
        loop {
            match common::drain(&mut fs, |fs| fs.fread(id, &mut buf)) {
                Ok(0) => break,
                Ok(n) => {
                    read_total += n as u64;
                    read_lines += buf[..n].iter().filter(|&&b| b == b'\n').count() as u64;
                }
                Err(e) => panic!("unexpected read error: {e}"),
            }
        }
        let _ = common::drain(&mut fs, |fs| fs.fclose(id));
    }

    assert!(read_total >= written_total, "read back {read_total} bytes but wrote {written_total}");
    assert!(read_lines >= written_lines, "read back {read_lines} lines but wrote {written_lines}");
}
