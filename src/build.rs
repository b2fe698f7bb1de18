//! Run the project's build and install commands and read missing modules out of the
//! build log.
//!
//! [`Toolchain::verify`] runs the build exactly once. The install-and-retry cycle belongs
//! to the caller so the number of rebuilds stays explicit.

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;

use crate::config::{CommandSpec, PackageConfig, ToolchainConfig};
use crate::repair::deps::base_package_name;
use crate::util::{cached_regex, run_command_with_timeout, tail_chars};

const MAX_COMMAND_OUTPUT_TAIL_CHARS: usize = 4_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildAttempt {
    pub ok: bool,
    pub missing_modules: BTreeSet<String>,
    pub timed_out: bool,
    pub duration_ms: u64,
    /// End of the combined stdout+stderr, where compilers put the errors.
    pub output_tail: String,
}

fn strip_ansi_sequences(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\u{1b}' && matches!(chars.peek(), Some('[')) {
            let _ = chars.next();
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
            continue;
        }
        out.push(ch);
    }
    out
}

/// Distinct base packages named by "Module not found ... '<x>'" and
/// "Cannot find module '<x>'". Project-local specifiers are ignored.
pub fn parse_missing_modules(output: &str, packages: &PackageConfig) -> BTreeSet<String> {
    static NOT_FOUND: OnceLock<Option<Regex>> = OnceLock::new();
    static CANNOT_FIND: OnceLock<Option<Regex>> = OnceLock::new();

    let output = strip_ansi_sequences(output);
    let mut missing = BTreeSet::new();
    for pattern in [
        // Webpack says "Can't resolve", whose apostrophe must not end the prefix.
        cached_regex(
            &NOT_FOUND,
            r"Module not found[^'\n]*?(?:Can't resolve\s*)?'([^']+)'",
        ),
        cached_regex(&CANNOT_FIND, r"Cannot find module '([^']+)'"),
    ]
    .into_iter()
    .flatten()
    {
        for specifier in pattern
            .captures_iter(&output)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str())
        {
            if specifier.starts_with(['.', '/', '~']) || packages.is_path_alias(specifier) {
                continue;
            }
            if specifier.starts_with("node:") {
                continue;
            }
            if let Some(base) = base_package_name(specifier) {
                missing.insert(base.to_string());
            }
        }
    }
    missing
}

/// The external build and install commands for one project.
pub struct Toolchain {
    config: ToolchainConfig,
    packages: PackageConfig,
}

impl Toolchain {
    pub fn new(config: ToolchainConfig, packages: PackageConfig) -> Self {
        Self { config, packages }
    }

    fn command(spec: &CommandSpec, cwd: &Path, extra: &[String]) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).args(extra).current_dir(cwd);
        cmd
    }

    /// Run the build once and report the outcome. Never fails; a command that cannot be
    /// started is a failed attempt.
    pub fn verify(&self, root: &Path) -> BuildAttempt {
        let spec = &self.config.build;
        let timeout = Duration::from_secs(self.config.build_timeout_secs);
        tracing::info!(command = %spec.display(), root = %root.display(), "running build");

        let start = Instant::now();
        let result = run_command_with_timeout(&mut Self::command(spec, root, &[]), timeout);
        let duration_ms = start.elapsed().as_millis() as u64;

        let run = match result {
            Ok(run) => run,
            Err(err) => {
                tracing::warn!(error = %err, "build command could not run");
                return BuildAttempt {
                    duration_ms,
                    output_tail: err,
                    ..BuildAttempt::default()
                };
            }
        };

        let combined = run.combined();
        let output_tail = tail_chars(&combined, MAX_COMMAND_OUTPUT_TAIL_CHARS);
        if run.timed_out {
            tracing::warn!(timeout_secs = self.config.build_timeout_secs, "build timed out");
            return BuildAttempt {
                timed_out: true,
                duration_ms,
                output_tail,
                ..BuildAttempt::default()
            };
        }
        if run.success() {
            tracing::info!(duration_ms, "build passed");
            return BuildAttempt {
                ok: true,
                duration_ms,
                output_tail,
                ..BuildAttempt::default()
            };
        }

        let missing_modules = parse_missing_modules(&combined, &self.packages);
        tracing::warn!(
            duration_ms,
            missing = ?missing_modules,
            "build failed"
        );
        BuildAttempt {
            ok: false,
            missing_modules,
            timed_out: false,
            duration_ms,
            output_tail,
        }
    }

    /// Install the named packages. Returns whether the install succeeded; failures are
    /// logged and left for the next build to surface.
    pub fn install_packages(&self, root: &Path, packages: &[String]) -> bool {
        if packages.is_empty() {
            return true;
        }
        tracing::info!(packages = ?packages, "installing missing packages");
        self.run_install(&self.config.install, root, packages)
    }

    /// Full dependency install from the manifest, if one is configured.
    pub fn install_all(&self, root: &Path) -> bool {
        match &self.config.install_all {
            Some(spec) => {
                tracing::info!(command = %spec.display(), "installing dependencies");
                self.run_install(spec, root, &[])
            }
            None => true,
        }
    }

    fn run_install(&self, spec: &CommandSpec, root: &Path, extra: &[String]) -> bool {
        let timeout = Duration::from_secs(self.config.install_timeout_secs);
        match run_command_with_timeout(&mut Self::command(spec, root, extra), timeout) {
            Ok(run) if run.success() => true,
            Ok(run) => {
                tracing::warn!(
                    command = %spec.display(),
                    timed_out = run.timed_out,
                    output = %tail_chars(&run.combined(), 500),
                    "install failed"
                );
                false
            }
            Err(err) => {
                tracing::warn!(command = %spec.display(), error = %err, "install could not run");
                false
            }
        }
    }
}
