use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own Rust sources.
const SOURCE_ROOTS: [&str; 4] = ["src", "gam", "delta", "tests"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

/// One lint rule: a line regex, a filter deciding whether a matching line is a real
/// violation, and the explanation printed when it is.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    is_violation: fn(&str) -> bool,
    advice: &'static str,
}

// Collects the violating lines of a single file.
struct RuleCollector<'r> {
    rule: &'r Rule,
    violations: Vec<String>,
}

impl Sink for RuleCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.rule.is_violation)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_comment_line(line: &str) -> bool {
    line.trim_start().starts_with("//") || line.contains("/*")
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

// Underscore-prefixed names are allowed inside string literals and comments.
fn underscore_outside_strings(line: &str) -> bool {
    if line.trim_start().starts_with("//") {
        return false;
    }
    let in_string = line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'));
    !in_string
}

fn forbidden_word_in_comment(line: &str) -> bool {
    FORBIDDEN_WORDS.iter().any(|word| line.contains(word))
}

fn stars_outside_doc_comment(line: &str) -> bool {
    !is_doc_comment(line)
}

fn comment_is_all_caps(line: &str) -> bool {
    if !is_comment_line(line) {
        return false;
    }
    let trimmed = line.trim_start();
    let text = if let Some(rest) = trimmed.strip_prefix("///").or_else(|| trimmed.strip_prefix("//!")) {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        rest
    } else if let Some(idx) = line.find("/*") {
        let rest = &line[idx + 2..];
        rest.find("*/").map_or(rest, |end| &rest[..end])
    } else {
        return false;
    };
    let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

fn always(_: &str) -> bool {
    true
}

const RULES: [Rule; 5] = [
    Rule {
        name: "underscore-prefixed identifiers",
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        is_violation: underscore_outside_strings,
        advice: "Either use the variable (removing the underscore) or remove it completely.",
    },
    Rule {
        name: "forbidden comment words",
        pattern: r"(//|/\*).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)",
        is_violation: forbidden_word_in_comment,
        advice: "Comments describing edits do not belong in the source. Remove them.",
    },
    Rule {
        name: "'**' in regular comments",
        pattern: r"(//|/\*).*\*\*",
        is_violation: stars_outside_doc_comment,
        advice: "Emphasis markers are only allowed in doc comments.",
    },
    Rule {
        name: "all-uppercase comments",
        pattern: r"(//|/\*).*",
        is_violation: comment_is_all_caps,
        advice: "Write comments in sentence case, or delete them.",
    },
    Rule {
        name: "#[allow(dead_code)] attributes",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        is_violation: always,
        advice: "Either use the code (removing the attribute) or remove it completely.",
    },
];

fn source_files() -> Vec<PathBuf> {
    SOURCE_ROOTS
        .iter()
        .flat_map(|root| WalkDir::new(root).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn check_file(path: &Path, rule: &Rule, searcher: &mut Searcher) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
    let mut collector = RuleCollector {
        rule,
        violations: Vec::new(),
    };
    searcher.search_path(&matcher, path, &mut collector)?;
    if collector.violations.is_empty() {
        return Ok(());
    }
    let mut message = format!(
        "\n❌ ERROR: Found {} {} in {}:\n",
        collector.violations.len(),
        rule.name,
        path.display()
    );
    for violation in &collector.violations {
        message.push_str(&format!("   {violation}\n"));
    }
    message.push_str(&format!("\n⚠️ {}\n", rule.advice));
    Err(message.into())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SOURCE_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    let mut searcher = Searcher::new();
    for path in source_files() {
        for rule in &RULES {
            if let Err(e) = check_file(&path, rule, &mut searcher) {
                eprintln!("{e}");
                std::process::exit(1);
            }
        }
    }
}
