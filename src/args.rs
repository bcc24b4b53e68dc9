//! Per-platform argument safety rules.
//!
//! Windows batch scripts and PowerShell re-interpret arguments after the OS
//! has already split them, so arguments that are perfectly safe for a normal
//! executable can change meaning when the command is a `.bat`/`.cmd` or
//! `.ps1` file. Each rule knows how to validate an argument vector and how
//! to format the final command line.
//!
//! The rule is selected from the command's file suffix at freeze time on
//! Windows; on other platforms every command uses [`ArgumentRule::Generic`].

use std::path::Path;

use crate::error::ArgumentError;

/// Characters a batch interpreter treats as active. Escaped with `^` when
/// formatting, rejected outright when validating is not possible.
const BATCH_ACTIVE: &[char] = &[
    '&', '<', '>', '[', ']', '{', '}', '^', '"', '=', ';', '!', '\'', '+', ',', '`', '~',
];

/// Argument handling rule for one stage's command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArgumentRule {
    /// No restrictions; arguments are passed through verbatim.
    #[default]
    Generic,
    /// Rules for `cmd.exe` batch scripts (`.bat`, `.cmd`).
    BatchScript,
    /// Rules for PowerShell scripts (`.ps1`); the command itself is replaced
    /// by a fixed `powershell.exe` wrapper invocation.
    PowerShell,
}

impl ArgumentRule {
    /// Select the rule for `command` from its file suffix.
    ///
    /// Only Windows has suffix-sensitive interpreters; everywhere else the
    /// generic rule applies.
    pub fn for_command(command: &Path) -> Self {
        if cfg!(windows) {
            match command
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase)
                .as_deref()
            {
                Some("bat" | "cmd") => Self::BatchScript,
                Some("ps1") => Self::PowerShell,
                _ => Self::Generic,
            }
        } else {
            Self::Generic
        }
    }

    /// Validate one argument against this rule.
    pub fn validate(self, index: usize, argument: &str) -> Result<(), ArgumentError> {
        let reject = |reason: &str| {
            Err(ArgumentError {
                index,
                argument: argument.to_string(),
                reason: reason.to_string(),
            })
        };
        match self {
            Self::Generic | Self::PowerShell => Ok(()),
            Self::BatchScript => {
                if argument.is_empty() {
                    return reject("batch arguments must not be empty");
                }
                let starts = argument.starts_with('"');
                let ends = argument.ends_with('"');
                if argument.len() == 1 && starts {
                    return reject("unbalanced quote");
                }
                if starts != ends {
                    return reject("an argument starting or ending with a quote must be fully quoted");
                }
                if argument.chars().any(|c| c.is_control()) {
                    return reject("control characters are not allowed in batch arguments");
                }
                if argument.contains('%') {
                    return reject("`%` is not allowed in batch arguments");
                }
                Ok(())
            }
        }
    }

    /// Validate a whole argument vector.
    pub fn validate_all(self, arguments: &[String]) -> Result<(), ArgumentError> {
        for (index, argument) in arguments.iter().enumerate() {
            self.validate(index, argument)?;
        }
        Ok(())
    }

    /// Produce the final command line: the command (or its wrapper)
    /// followed by the formatted arguments.
    pub fn format(self, command: &Path, arguments: &[String]) -> Vec<String> {
        match self {
            Self::Generic => {
                let mut v = Vec::with_capacity(arguments.len() + 1);
                v.push(command.display().to_string());
                v.extend(arguments.iter().cloned());
                v
            }
            Self::BatchScript => {
                let mut v = Vec::with_capacity(arguments.len() + 1);
                v.push(command.display().to_string());
                v.extend(arguments.iter().map(|a| quote_batch(a)));
                v
            }
            Self::PowerShell => {
                let mut v = Vec::with_capacity(arguments.len() + 5);
                v.push("powershell.exe".to_string());
                v.push("-ExecutionPolicy".to_string());
                v.push("Bypass".to_string());
                v.push("-File".to_string());
                v.push(command.display().to_string());
                v.extend(arguments.iter().cloned());
                v
            }
        }
    }
}

/// Quote a batch argument: escape every shell-active character with `^` and
/// wrap the result in double quotes. Arguments with no active characters and
/// no whitespace pass through unchanged.
fn quote_batch(argument: &str) -> String {
    let needs_quoting = argument
        .chars()
        .any(|c| c.is_whitespace() || BATCH_ACTIVE.contains(&c));
    if !needs_quoting {
        return argument.to_string();
    }
    let mut out = String::with_capacity(argument.len() + 8);
    out.push('"');
    for c in argument.chars() {
        if BATCH_ACTIVE.contains(&c) {
            out.push('^');
        }
        out.push(c);
    }
    out.push('"');
    out
}
