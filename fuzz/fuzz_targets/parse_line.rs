#![no_main]

use std::sync::OnceLock;

use dormilon::traceline::LineTokenizer;
use libfuzzer_sys::fuzz_target;

static TOKENIZER: OnceLock<LineTokenizer> = OnceLock::new();

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Neither parse path may panic, whatever the line contains
        let tok = TOKENIZER.get_or_init(LineTokenizer::new);
        for line in input.lines() {
            let _ = tok.parse_line(line);
            let _ = tok.parse_stack_line(line);
        }
    }
});
