//! The atomic unit of configuration
//!
//! A [`Unit`] asserts one fact about a machine (a package is installed, a file
//! has some content, a mount is present) and knows how to remediate it. Units
//! compile to three script fragments:
//!
//! - [`Unit::gen_audit`]: check only, count the result
//! - [`Unit::gen_config`]: check, remediate if the precondition holds, re-check
//! - [`Unit::gen_dry_run`]: check, print what remediation would run
//!
//! Every fragment defines a `<label>_audit` function that sets
//! `<label>_audit_passed` to `1` or `0`, so later units can name this one as
//! their precondition.

use crate::core::script::Action;
use crate::core::shell::{self, GREEN, RED, RESET, ScriptWriter};
use crate::utils::to_identifier;
use serde::{Deserialize, Serialize};

/// The precondition every script header marks as passed
pub const PROCEED: &str = "proceed";

/// How the audit output is compared with the unit's expected `test` value
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum Outcome {
    /// Passes when the audit output equals `test`
    #[default]
    #[strum(serialize = "pass")]
    Pass,
    /// Passes when the audit output differs from `test`
    #[strum(serialize = "fail")]
    Fail,
}

impl Outcome {
    /// The `[` operator implementing this comparison
    pub const fn operator(self) -> &'static str {
        match self {
            Outcome::Pass => "=",
            Outcome::Fail => "!=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    label: String,
    precondition: String,
    config: String,
    audit: String,
    test: String,
    outcome: Outcome,
    message: String,
    #[serde(default)]
    dry_run: String,
}

impl Unit {
    /// Creates a unit. `label` and `precondition` are normalized with
    /// [`to_identifier`]; an empty precondition means [`PROCEED`].
    ///
    /// # Example
    ///
    /// ```
    /// use drnet::core::unit::{Outcome, Unit};
    ///
    /// let unit = Unit::new(
    ///     "disk_mounted",
    ///     "is_guest",
    ///     "sudo mount /dev/sdb1 /data",
    ///     "mount | grep /data",
    ///     "",
    ///     Outcome::Fail,
    ///     "disk missing",
    /// );
    /// assert_eq!(unit.label(), "disk_mounted");
    /// assert!(unit.gen_config(false).contains("$is_guest_audit_passed"));
    /// ```
    pub fn new(
        label: &str,
        precondition: &str,
        config: impl Into<String>,
        audit: impl Into<String>,
        test: impl Into<String>,
        outcome: Outcome,
        message: impl Into<String>,
    ) -> Self {
        let precondition = if precondition.trim().is_empty() {
            PROCEED.to_string()
        } else {
            to_identifier(precondition)
        };
        Self {
            label: to_identifier(label),
            precondition,
            config: config.into(),
            audit: audit.into(),
            test: test.into(),
            outcome,
            message: message.into(),
            dry_run: String::new(),
        }
    }

    /// Extra text printed by the dry-run fragment when the audit fails.
    pub fn with_dry_run(mut self, text: impl Into<String>) -> Self {
        self.dry_run = text.into();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn precondition(&self) -> &str {
        &self.precondition
    }

    pub fn config(&self) -> &str {
        &self.config
    }

    pub fn audit(&self) -> &str {
        &self.audit
    }

    pub fn test(&self) -> &str {
        &self.test
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Renders the fragment for `action`.
    pub fn render(&self, action: Action, quiet: bool) -> String {
        match action {
            Action::Audit => self.gen_audit(quiet),
            Action::Config => self.gen_config(quiet),
            Action::DryRun => self.gen_dry_run(quiet),
        }
    }

    pub fn gen_audit(&self, quiet: bool) -> String {
        let mut w = ScriptWriter::new();
        self.write_audit_function(&mut w);
        w.line(self.audit_fn());
        let passed = self.passed_check();
        w.block(&format!("if {passed} ; then"), "fi ;", |w| {
            self.write_pass(w, quiet);
            w.branch("else", |w| self.write_fail(w, quiet));
        });
        w.finish()
    }

    pub fn gen_config(&self, quiet: bool) -> String {
        let mut w = ScriptWriter::new();
        self.write_audit_function(&mut w);
        w.line(self.audit_fn());
        let passed = self.passed_check();
        let label = &self.label;
        let precondition = &self.precondition;
        w.block(&format!("if {passed} ; then"), "fi ;", |w| {
            self.write_pass(w, quiet);
            w.branch(
                &format!("elif [ \"${precondition}_audit_passed\" = \"1\" ] ; then"),
                |w| {
                    w.echo(&format!("Configuring {label}"));
                    w.command(&self.config);
                    w.echo(&format!("{label} configured... Retesting"));
                    w.line(self.audit_fn());
                    w.block(&format!("if {passed} ; then"), "fi ;", |w| {
                        self.write_pass(w, quiet);
                        w.branch("else", |w| self.write_fail(w, quiet));
                    });
                },
            );
            w.branch("else", |w| {
                w.echo(&format!("{RED} ❌ {RESET} PRECONDITION FAILED {precondition}_audit"));
                w.line("((++failed))");
                w.append_failure(&format!(
                    "{label} skipped: precondition {precondition} failed"
                ));
            });
        });
        w.finish()
    }

    pub fn gen_dry_run(&self, quiet: bool) -> String {
        let mut w = ScriptWriter::new();
        self.write_audit_function(&mut w);
        w.line(self.audit_fn());
        let passed = self.passed_check();
        let label = &self.label;
        w.block(&format!("if {passed} ; then"), "fi ;", |w| {
            self.write_pass(w, quiet);
            w.branch("else", |w| {
                w.echo(&format!("{RED} ❌ {RESET} {label} DRYRUN, would run:"));
                w.line(format!("printf '%s\\n' {}", shell::single_quoted(&self.config)));
                if !self.dry_run.is_empty() {
                    w.line(format!("printf '%s\\n' {}", shell::single_quoted(&self.dry_run)));
                }
                w.line("((++failed))");
                w.append_failure(label);
            });
        });
        w.finish()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Fragment helpers
    // ═══════════════════════════════════════════════════════════════════════════

    fn audit_fn(&self) -> String {
        format!("{}_audit", self.label)
    }

    fn passed_check(&self) -> String {
        format!("[ \"${}_audit_passed\" = \"1\" ]", self.label)
    }

    fn write_audit_function(&self, w: &mut ScriptWriter) {
        let label = &self.label;
        w.block(&format!("{label}_audit() {{"), "}", |w| {
            if self.audit.contains('\n') {
                w.line("out=$(");
                w.command(&self.audit);
                w.line(");");
            } else {
                w.line(format!("out=$({});", self.audit));
            }
            w.line(format!("test=\"{}\";", shell::double_quoted(&self.test)));
            w.block(
                &format!(
                    "if [ \"$out\" {} \"$test\" ] ; then",
                    self.outcome.operator()
                ),
                "fi ;",
                |w| {
                    w.line(format!("{label}_audit_passed=1"));
                    w.branch("else", |w| {
                        w.line(format!("{label}_audit_passed=0"));
                    });
                },
            );
        });
    }

    fn write_pass(&self, w: &mut ScriptWriter, quiet: bool) {
        if !quiet {
            w.echo(&format!("{GREEN} ✓ {RESET} {}_audit", self.label));
        }
        w.line("((++passed))");
    }

    fn write_fail(&self, w: &mut ScriptWriter, quiet: bool) {
        let label = &self.label;
        if !quiet {
            w.echo(&format!("{RED} ❌ {RESET} {label}_audit"));
        }
        w.line("((++failed))");
        w.append_failure(&format!(
            "{label}_audit failed with the output: \\\"${{out}}\\\". {}",
            shell::double_quoted(&self.message)
        ));
    }
}
