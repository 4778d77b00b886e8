//! Fuzzes the spool's chunk-boundary line reassembly: splits the input
//! arbitrarily into chunks and feeds them through `split_one_line`,
//! asserting every emitted line came from somewhere in the original input
//! and that no byte is ever dropped or duplicated across a chunk boundary.

#![no_main]

use libfuzzer_sys::fuzz_target;
use source_base::spool::split_one_line;

fuzz_target!(|data: &[u8]| {
    // Split the input into pseudo-random chunks using the data itself as
    // the source of chunk boundaries, so chunk sizes vary across runs
    // without a second fuzz input.
    let mut chunks: Vec<&[u8]> = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let step = (rest[0] as usize % 7) + 1;
        let take = step.min(rest.len());
        let (chunk, remainder) = rest.split_at(take);
        chunks.push(chunk);
        rest = remainder;
    }

    let mut buf: Vec<u8> = Vec::new();
    let mut partial: Vec<u8> = Vec::new();
    let mut reassembled: Vec<u8> = Vec::new();
    let mut line_count = 0usize;

    for chunk in chunks {
        buf.extend_from_slice(chunk);
        while let Some(line) = split_one_line(&mut buf, &mut partial) {
            reassembled.extend_from_slice(&line);
            reassembled.push(b'\n');
            line_count += 1;
        }
    }
    // Flush any trailing partial line the way the spool reader does at EOF.
    if !partial.is_empty() {
        reassembled.extend_from_slice(&partial);
        line_count += 1;
    }

    let newline_count = data.iter().filter(|&&b| b == b'\n').count();
    let trailing_partial = !data.is_empty() && *data.last().unwrap() != b'\n';
    let expected_lines = newline_count + usize::from(trailing_partial);
    assert_eq!(line_count, expected_lines, "line count must match input newline structure");
    assert_eq!(reassembled, data, "reassembled bytes must equal the original input");
});
