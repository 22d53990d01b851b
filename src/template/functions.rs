//! # Pipe Functions
//!
//! Pure string functions usable after `|` in a name template, keyed by name.

use std::collections::HashMap;
use std::sync::LazyLock;

/// A registered pipe function
#[derive(Debug)]
pub struct PipeFunction {
    pub name: &'static str,
    /// Number of arguments after the function name
    pub arity: usize,
    apply: fn(&str, &[String]) -> String,
}

impl PipeFunction {
    /// Apply to `input`; callers have already checked the arity
    #[must_use]
    pub fn apply(&self, input: &str, args: &[String]) -> String {
        (self.apply)(input, args)
    }
}

static REGISTRY: LazyLock<HashMap<&'static str, PipeFunction>> = LazyLock::new(|| {
    [
        PipeFunction {
            name: "uppercase",
            arity: 0,
            apply: |input, _| input.to_uppercase(),
        },
        PipeFunction {
            name: "lowercase",
            arity: 0,
            apply: |input, _| input.to_lowercase(),
        },
        PipeFunction {
            name: "replace",
            arity: 2,
            apply: |input, args| input.replace(args[0].as_str(), &args[1]),
        },
        PipeFunction {
            name: "trimprefix",
            arity: 1,
            apply: |input, args| {
                input
                    .strip_prefix(args[0].as_str())
                    .unwrap_or(input)
                    .to_string()
            },
        },
        PipeFunction {
            name: "trimsuffix",
            arity: 1,
            apply: |input, args| {
                input
                    .strip_suffix(args[0].as_str())
                    .unwrap_or(input)
                    .to_string()
            },
        },
    ]
    .into_iter()
    .map(|function| (function.name, function))
    .collect()
});

/// Look up a pipe function by name
#[must_use]
pub fn lookup(name: &str) -> Option<&'static PipeFunction> {
    REGISTRY.get(name)
}

/// Registered function names, sorted
#[must_use]
pub fn names() -> Vec<&'static str> {
    let mut names: Vec<_> = REGISTRY.keys().copied().collect();
    names.sort_unstable();
    names
}
