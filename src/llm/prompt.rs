use similar::{ChangeTag, TextDiff};

use crate::detectors::units::GLOBALS_ID;
use crate::state::{FeedMode, Phase, TestSuite, TranslationUnit, UnitKind, VerificationOutcome};

const MAX_EXAMPLE_CASES: usize = 3;
const MAX_DIAGNOSTIC_CHARS: usize = 6_000;

#[derive(Debug, Clone)]
pub struct LlmPrompt {
    pub system: String,
    pub user: String,
}

/// Previous attempt, rendered as structured repair feedback.
#[derive(Debug, Clone, Copy)]
pub struct RepairFeedback<'a> {
    pub attempt: u32,
    pub previous_code: &'a str,
    pub outcome: &'a VerificationOutcome,
}

/// Already-accepted translation of a dependency unit.
#[derive(Debug, Clone)]
pub struct DependencyCode {
    pub unit_id: String,
    pub code: String,
}

#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub unit: &'a TranslationUnit,
    pub phase: Phase,
    /// Accepted unidiomatic code; the starting point for the idiomatic phase.
    pub baseline: Option<&'a str>,
    pub dependencies: &'a [DependencyCode],
    pub suite: Option<&'a TestSuite>,
    pub repair: Option<RepairFeedback<'a>>,
}

pub fn build_prompt(ctx: &PromptContext<'_>) -> LlmPrompt {
    LlmPrompt {
        system: system_prompt(ctx.phase),
        user: user_prompt(ctx),
    }
}

/* ============================================================
   System prompt (stable per phase)
   ============================================================ */

fn system_prompt(phase: Phase) -> String {
    let mut s = String::from(
        "You are an expert C and Rust engineer translating C programs to Rust.\n\
         \n\
         Rules:\n\
         - Preserve observable behavior exactly: stdout bytes, argument and stdin handling\n\
         - Do not print anything the C program does not print\n\
         - Only output a single ```rust code block, nothing else\n",
    );

    match phase {
        Phase::Unidiomatic => s.push_str(
            "- Translate directly; raw pointers, libc calls and unsafe are allowed\n\
             - Keep the same function and type names as the C source\n",
        ),
        Phase::Idiomatic => s.push_str(
            "- Rewrite into safe, idiomatic Rust\n\
             - No `unsafe` anywhere: no unsafe blocks, functions, impls or traits\n\
             - Replace raw memory manipulation with owned types, slices, references and borrowing\n\
             - Use the standard library (String, Vec, iterators, Option, Result) instead of libc\n",
        ),
    }

    s
}

/* ============================================================
   User prompt
   ============================================================ */

fn user_prompt(ctx: &PromptContext<'_>) -> String {
    let mut out = String::new();
    let unit = ctx.unit;

    /* ---------- TASK ---------- */
    out.push_str("TASK\n");
    match (ctx.phase, unit.kind) {
        (Phase::Unidiomatic, UnitKind::Program) => {
            out.push_str("Translate the following C program to a complete Rust program with `fn main`.\n\n")
        }
        (Phase::Unidiomatic, UnitKind::Function) => out.push_str(&format!(
            "Translate the C function `{}` to Rust.\n\n",
            symbol_name(&unit.id)
        )),
        (Phase::Unidiomatic, UnitKind::Type) if unit.id == GLOBALS_ID => out.push_str(
            "Translate the following C global variables, constants and macros to Rust \
             `static`, `const` or `macro_rules!` items with the same names.\n\n",
        ),
        (Phase::Unidiomatic, UnitKind::Type) => out.push_str(&format!(
            "Translate the C type `{}` to a Rust type with the same layout (#[repr(C)]).\n\n",
            symbol_name(&unit.id)
        )),
        (Phase::Idiomatic, _) => out.push_str(
            "Rewrite the verified Rust translation below into idiomatic, safe Rust.\n\
             Behavior must stay identical; it is checked against the same tests.\n\n",
        ),
    }

    if let Some(sig) = &unit.signature {
        out.push_str(&format!("Required C signature: {}\n", sig));
        if unit.entry {
            out.push_str("This unit contains the program entry point.\n");
        }
        out.push('\n');
    }

    /* ---------- SOURCE ---------- */
    out.push_str("C SOURCE\n```c\n");
    out.push_str(unit.source.trim());
    out.push_str("\n```\n\n");

    if let Some(base) = ctx.baseline {
        out.push_str("VERIFIED RUST TRANSLATION\n```rust\n");
        out.push_str(base.trim());
        out.push_str("\n```\n\n");
    }

    /* ---------- DEPENDENCIES ---------- */
    if !ctx.dependencies.is_empty() {
        out.push_str("ALREADY TRANSLATED DEPENDENCIES (in scope, do not redefine)\n");
        for dep in ctx.dependencies {
            out.push_str(&format!(
                "// {}\n```rust\n{}\n```\n",
                symbol_name(&dep.unit_id),
                dep.code.trim()
            ));
        }
        out.push('\n');
    }

    /* ---------- EXAMPLES ---------- */
    if let Some(suite) = ctx.suite {
        if !suite.is_empty() {
            out.push_str("EXPECTED BEHAVIOR\n");
            out.push_str(match suite.feed {
                FeedMode::Arguments => "Input is passed as command-line arguments.\n",
                FeedMode::Stdin => "Input is passed on standard input.\n",
            });
            for (i, case) in suite.cases.iter().take(MAX_EXAMPLE_CASES).enumerate() {
                out.push_str(&format!(
                    "- case {}: input {:?} -> output {:?}\n",
                    i,
                    case.input,
                    case.expected_output.as_deref().unwrap_or("")
                ));
            }
            out.push('\n');
        }
    }

    /* ---------- REPAIR ---------- */
    if let Some(fb) = &ctx.repair {
        out.push_str(&render_feedback(fb, ctx.suite));
    }

    out
}

/* ============================================================
   Repair feedback
   ============================================================ */

pub fn render_feedback(fb: &RepairFeedback<'_>, suite: Option<&TestSuite>) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "PREVIOUS ATTEMPT {} FAILED: {}\n```rust\n{}\n```\n\n",
        fb.attempt + 1,
        fb.outcome.kind(),
        fb.previous_code.trim()
    ));

    out.push_str("FAILURE DETAILS\n");
    match fb.outcome {
        VerificationOutcome::Success => {}

        VerificationOutcome::CompileError(msg) => {
            out.push_str("The code does not compile. Compiler output:\n");
            out.push_str(&clip(msg));
            out.push_str("\nFix every error while keeping behavior.\n");
        }

        VerificationOutcome::LintError(msg) => {
            out.push_str("Static analysis (clippy) reported errors:\n");
            out.push_str(&clip(msg));
            out.push_str("\nFix the reported problems.\n");
        }

        VerificationOutcome::SafetyViolation(msg) => {
            out.push_str("The code uses `unsafe`, which is not allowed in this phase:\n");
            out.push_str(&clip(msg));
            out.push_str("\nRemove every use of unsafe with safe equivalents.\n");
        }

        VerificationOutcome::TestFailure {
            index,
            actual,
            expected,
        } => {
            if let Some(case) = suite.and_then(|s| s.cases.get(*index)) {
                out.push_str(&format!("Test case {} with input {:?}\n", index, case.input));
            } else {
                out.push_str(&format!("Test case {}\n", index));
            }
            out.push_str(&format!("Expected output:\n{}\n", expected));
            out.push_str(&format!("Actual output:\n{}\n", actual));
            out.push_str("Diff (- expected, + actual):\n");
            out.push_str(&output_diff(expected, actual));
        }

        VerificationOutcome::TestTimeout { index } => {
            let input = suite
                .and_then(|s| s.cases.get(*index))
                .map(|c| format!(" with input {:?}", c.input))
                .unwrap_or_default();
            out.push_str(&format!(
                "Test case {}{} did not finish in time. Look for infinite loops or blocking reads.\n",
                index, input
            ));
        }

        VerificationOutcome::MemorySafetyError(report) => {
            out.push_str("The memory checker reported errors:\n");
            out.push_str(&clip(report));
            out.push_str("\nFix invalid reads/writes, uninitialized values and double frees.\n");
        }
    }

    out.push_str("\nReturn the full corrected translation.\n");
    out
}

/// Line diff of expected vs actual output.
pub fn output_diff(expected: &str, actual: &str) -> String {
    let diff = TextDiff::from_lines(expected, actual);
    let mut out = String::new();

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => '-',
            ChangeTag::Insert => '+',
            ChangeTag::Equal => ' ',
        };
        out.push(sign);
        out.push_str(change.value().trim_end_matches('\n'));
        out.push('\n');
    }

    out
}

fn clip(s: &str) -> String {
    let trimmed = s.trim();
    if trimmed.chars().count() <= MAX_DIAGNOSTIC_CHARS {
        return trimmed.to_string();
    }
    let head: String = trimmed.chars().take(MAX_DIAGNOSTIC_CHARS).collect();
    format!("{}\n...truncated...", head)
}

/// `fn:add` -> `add`, `type:Point` -> `Point`; other ids unchanged.
fn symbol_name(id: &str) -> &str {
    id.split_once(':').map(|(_, name)| name).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TestCase;

    fn suite() -> TestSuite {
        let mut s = TestSuite::new(FeedMode::Arguments);
        s.push(TestCase::resolved("5", "5"));
        s.push(TestCase::resolved("7", "7"));
        s
    }

    #[test]
    fn first_attempt_has_no_repair_section() {
        let unit = TranslationUnit::program("p", "int main(){return 0;}");
        let p = build_prompt(&PromptContext {
            unit: &unit,
            phase: Phase::Unidiomatic,
            baseline: None,
            dependencies: &[],
            suite: Some(&suite()),
            repair: None,
        });
        assert!(p.user.contains("C SOURCE"));
        assert!(p.user.contains("command-line arguments"));
        assert!(!p.user.contains("PREVIOUS ATTEMPT"));
    }

    #[test]
    fn idiomatic_prompt_forbids_unsafe_and_carries_baseline() {
        let unit = TranslationUnit::program("p", "int main(){return 0;}");
        let p = build_prompt(&PromptContext {
            unit: &unit,
            phase: Phase::Idiomatic,
            baseline: Some("fn main() {}"),
            dependencies: &[],
            suite: None,
            repair: None,
        });
        assert!(p.system.contains("No `unsafe`"));
        assert!(p.user.contains("VERIFIED RUST TRANSLATION"));
    }

    #[test]
    fn test_failure_feedback_names_input_and_diff() {
        let outcome = VerificationOutcome::TestFailure {
            index: 1,
            actual: "8".into(),
            expected: "7".into(),
        };
        let s = suite();
        let text = render_feedback(
            &RepairFeedback {
                attempt: 0,
                previous_code: "fn main() {}",
                outcome: &outcome,
            },
            Some(&s),
        );
        assert!(text.contains("input \"7\""));
        assert!(text.contains("-7"));
        assert!(text.contains("+8"));
    }

    #[test]
    fn compile_feedback_is_clipped() {
        let long = "e".repeat(MAX_DIAGNOSTIC_CHARS + 10);
        let outcome = VerificationOutcome::CompileError(long);
        let text = render_feedback(
            &RepairFeedback {
                attempt: 2,
                previous_code: "",
                outcome: &outcome,
            },
            None,
        );
        assert!(text.contains("PREVIOUS ATTEMPT 3"));
        assert!(text.contains("...truncated..."));
    }

    fn unit(id: &str, kind: UnitKind) -> TranslationUnit {
        TranslationUnit {
            id: id.into(),
            kind,
            source: "int x = 1;".into(),
            signature: None,
            dependencies: Vec::new(),
            entry: false,
        }
    }

    fn unidiomatic_user(unit: &TranslationUnit, deps: &[DependencyCode]) -> String {
        build_prompt(&PromptContext {
            unit,
            phase: Phase::Unidiomatic,
            baseline: None,
            dependencies: deps,
            suite: None,
            repair: None,
        })
        .user
    }

    #[test]
    fn globals_unit_gets_its_own_task() {
        let text = unidiomatic_user(&unit(GLOBALS_ID, UnitKind::Type), &[]);
        assert!(text.contains("global variables"));
        assert!(!text.contains("repr(C)"));
    }

    #[test]
    fn prompts_use_plain_symbol_names() {
        let deps = vec![DependencyCode {
            unit_id: "type:Point".into(),
            code: "struct Point;".into(),
        }];
        let text = unidiomatic_user(&unit("fn:add", UnitKind::Function), &deps);
        assert!(text.contains("C function `add`"));
        assert!(text.contains("// Point\n"));
        assert!(!text.contains("fn:add"));
        assert!(!text.contains("type:Point"));

        let ty = unidiomatic_user(&unit("type:Point", UnitKind::Type), &[]);
        assert!(ty.contains("C type `Point`"));
    }
}
