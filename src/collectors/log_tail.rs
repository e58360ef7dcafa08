use crate::collectors::ProbeError;
use crate::config::LogTailMode;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

const PLACEHOLDER_BODY: &str = "TODO: implement this logic\nhello, world\nthis is a test";

pub fn header(path: &Path, lines: usize) -> String {
    format!("tail -n {lines} {}:\n", path.display())
}

/// Last `lines` lines of `path`, preceded by a `tail -n` header line.
pub fn tail_log_file(path: &Path, lines: usize, mode: LogTailMode) -> Result<String, ProbeError> {
    let mut out = header(path, lines);
    match mode {
        LogTailMode::Placeholder => out.push_str(PLACEHOLDER_BODY),
        LogTailMode::Read => {
            for line in last_lines(path, lines)? {
                out.push_str(&String::from_utf8_lossy(&line));
                out.push('\n');
            }
        }
    }
    Ok(out)
}

fn last_lines(path: &Path, keep: usize) -> Result<VecDeque<Vec<u8>>, ProbeError> {
    let unreadable = |source| ProbeError::LogFileUnreadable {
        path: path.display().to_string(),
        source,
    };

    let file = File::open(path).map_err(unreadable)?;
    let mut reader = BufReader::new(file);
    let mut ring: VecDeque<Vec<u8>> = VecDeque::with_capacity(keep.min(4096));
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf).map_err(unreadable)?;
        if read == 0 {
            break;
        }
        if keep == 0 {
            continue;
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        if ring.len() == keep {
            ring.pop_front();
        }
        ring.push_back(buf.clone());
    }
    Ok(ring)
}
