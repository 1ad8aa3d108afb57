//! oracle/analysis.rs
//!
//! Static inspection of a C entry point: how input arrives and what shape
//! each input slot has. Plus input synthesis from that shape.

use std::sync::OnceLock;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;

use crate::state::FeedMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Integer,
    Float,
    Word,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputShape {
    pub feed: FeedMode,
    /// One entry per value the program reads. Never empty.
    pub slots: Vec<SlotKind>,
}

fn argv_conversion() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(atoi|atol|atoll|strtol|strtoll|strtoul|atof|strtod|strtof)\s*\(\s*argv\s*\[\s*(\d+)\s*\]")
            .expect("argv pattern is valid")
    })
}

fn argv_index() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"argv\s*\[\s*(\d+)\s*\]").expect("argv index pattern is valid"))
}

fn scanf_format() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\bscanf\s*\(\s*"((?:[^"\\]|\\.)*)""#).expect("scanf pattern is valid")
    })
}

fn conversion() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"%\*?\d*(hh|h|ll|l|L|z|j|t)?([diuoxXfFeEgGaAscp\[])").expect("conversion pattern is valid")
    })
}

/// Classify the input channel and slot kinds from source text.
pub fn analyze(source: &str) -> InputShape {
    let uses_argv = source.contains("argv[") && source.contains("argc");
    let uses_stdin = ["scanf(", "getchar(", "fgets(", "gets(", "getline(", "read(0", "fread("]
        .iter()
        .any(|p| source.contains(p));

    if uses_argv {
        return InputShape {
            feed: FeedMode::Arguments,
            slots: argv_slots(source),
        };
    }

    if uses_stdin {
        return InputShape {
            feed: FeedMode::Stdin,
            slots: stdin_slots(source),
        };
    }

    InputShape {
        feed: FeedMode::Arguments,
        slots: vec![SlotKind::Integer],
    }
}

fn argv_slots(source: &str) -> Vec<SlotKind> {
    let highest = argv_index()
        .captures_iter(source)
        .filter_map(|c| c.get(1)?.as_str().parse::<usize>().ok())
        .filter(|i| *i >= 1)
        .max()
        .unwrap_or(1);

    let mut slots = vec![SlotKind::Word; highest];

    for caps in argv_conversion().captures_iter(source) {
        let func = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let idx = caps.get(2).and_then(|m| m.as_str().parse::<usize>().ok());

        if let Some(i) = idx.filter(|i| *i >= 1 && *i <= highest) {
            slots[i - 1] = match func {
                "atof" | "strtod" | "strtof" => SlotKind::Float,
                _ => SlotKind::Integer,
            };
        }
    }

    slots
}

fn stdin_slots(source: &str) -> Vec<SlotKind> {
    let mut slots = Vec::new();

    for caps in scanf_format().captures_iter(source) {
        let fmt = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        for conv in conversion().captures_iter(fmt) {
            if conv.get(0).map(|m| m.as_str().starts_with("%*")).unwrap_or(false) {
                continue;
            }
            let kind = match conv.get(2).map(|m| m.as_str()).unwrap_or("") {
                "d" | "i" | "u" | "o" | "x" | "X" => SlotKind::Integer,
                "f" | "F" | "e" | "E" | "g" | "G" | "a" | "A" => SlotKind::Float,
                _ => SlotKind::Word,
            };
            slots.push(kind);
        }
    }

    if slots.is_empty() {
        slots.push(SlotKind::Integer);
    }
    slots
}

/* ============================================================
   Input synthesis
   ============================================================ */

/// Boundary plus nominal rows produced before any random input.
pub const FIXED_INPUTS: usize = INT_BOUNDARY.len() + INT_NOMINAL.len();

const INT_BOUNDARY: [&str; 4] = ["0", "1", "-1", "2147483647"];
const INT_NOMINAL: [&str; 3] = ["10", "42", "100"];
const FLOAT_BOUNDARY: [&str; 4] = ["0.0", "1.0", "-1.5", "3.4e38"];
const FLOAT_NOMINAL: [&str; 3] = ["2.5", "3.14", "100.25"];
const WORD_BOUNDARY: [&str; 4] = ["a", "z", "A", "zzzzzzzzzz"];
const WORD_NOMINAL: [&str; 3] = ["hello", "test", "abc"];

/// Ordered inputs: boundary values, nominal values, then up to
/// `max_random` seeded random values. Same seed, same inputs.
pub fn synthesize(shape: &InputShape, max_random: usize, seed: u64) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut inputs: Vec<String> = Vec::new();

    for row in 0..FIXED_INPUTS {
        let values: Vec<String> = shape
            .slots
            .iter()
            .map(|kind| fixed_value(*kind, row).to_string())
            .collect();
        push_unique(&mut inputs, join(shape.feed, &values));
    }

    for _ in 0..max_random {
        let values: Vec<String> = shape
            .slots
            .iter()
            .map(|kind| random_value(*kind, &mut rng))
            .collect();
        push_unique(&mut inputs, join(shape.feed, &values));
    }

    inputs
}

fn fixed_value(kind: SlotKind, row: usize) -> &'static str {
    let (boundary, nominal): (&[&str], &[&str]) = match kind {
        SlotKind::Integer => (&INT_BOUNDARY, &INT_NOMINAL),
        SlotKind::Float => (&FLOAT_BOUNDARY, &FLOAT_NOMINAL),
        SlotKind::Word => (&WORD_BOUNDARY, &WORD_NOMINAL),
    };

    if row < boundary.len() {
        boundary[row]
    } else {
        nominal[(row - boundary.len()) % nominal.len()]
    }
}

fn random_value(kind: SlotKind, rng: &mut StdRng) -> String {
    match kind {
        SlotKind::Integer => rng.random_range(-1000i64..=1000).to_string(),
        SlotKind::Float => format!("{:.2}", rng.random_range(-100.0f64..100.0)),
        SlotKind::Word => {
            let len = rng.random_range(1..=8);
            (0..len)
                .map(|_| (b'a' + rng.random_range(0..26u8)) as char)
                .collect()
        }
    }
}

fn join(feed: FeedMode, values: &[String]) -> String {
    match feed {
        FeedMode::Arguments => values.join(" "),
        FeedMode::Stdin => values.join("\n"),
    }
}

fn push_unique(inputs: &mut Vec<String>, input: String) {
    if !inputs.contains(&input) {
        inputs.push(input);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_program_with_atoi_slots() {
        let src = r#"
#include <stdlib.h>
int main(int argc, char **argv) {
    int a = atoi(argv[1]);
    double b = atof(argv[2]);
    printf("%s %d %f\n", argv[3], a, b);
}
"#;
        let shape = analyze(src);
        assert_eq!(shape.feed, FeedMode::Arguments);
        assert_eq!(shape.slots, vec![SlotKind::Integer, SlotKind::Float, SlotKind::Word]);
    }

    #[test]
    fn scanf_program_reads_stdin_slots() {
        let src = r#"int main(void){ int n; double x; char s[8]; scanf("%d %lf", &n, &x); scanf("%7s", s); }"#;
        let shape = analyze(src);
        assert_eq!(shape.feed, FeedMode::Stdin);
        assert_eq!(shape.slots, vec![SlotKind::Integer, SlotKind::Float, SlotKind::Word]);
    }

    #[test]
    fn unknown_channel_defaults_to_one_argument() {
        let shape = analyze("int main(void){ puts(\"hi\"); }");
        assert_eq!(shape.feed, FeedMode::Arguments);
        assert_eq!(shape.slots.len(), 1);
    }

    #[test]
    fn synthesized_inputs_start_with_boundaries() {
        let shape = InputShape {
            feed: FeedMode::Arguments,
            slots: vec![SlotKind::Integer],
        };
        let inputs = synthesize(&shape, 3, 7);
        assert_eq!(&inputs[..4], &["0", "1", "-1", "2147483647"]);
        assert!(inputs.len() <= 7 + 3);
    }

    #[test]
    fn same_seed_same_inputs() {
        let shape = InputShape {
            feed: FeedMode::Stdin,
            slots: vec![SlotKind::Integer, SlotKind::Word],
        };
        assert_eq!(synthesize(&shape, 5, 99), synthesize(&shape, 5, 99));
        assert!(synthesize(&shape, 0, 1)[0].contains('\n'));
    }
}
