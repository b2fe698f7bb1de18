//! Rewrite default imports of project files that only export a named binding.
//!
//! `import Button from "./Button"` against a file with `export function Button` and no
//! default export becomes `import { Button } from "./Button"`. Everything else is left
//! for the build to report.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::config::{PackageConfig, TreeConfig};
use crate::project::{source_files, SourceFile};
use crate::util::{cached_regex, write_atomic};

const RESOLVE_EXTENSIONS: &[&str] = &["tsx", "ts", "jsx", "js"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportInfo {
    pub has_default: bool,
    pub named_exports: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FixReport {
    pub files_rewritten: usize,
    pub imports_rewritten: usize,
}

/// Heuristic export shape of one source file.
pub fn export_info(source: &str) -> ExportInfo {
    static DEFAULT: OnceLock<Option<Regex>> = OnceLock::new();
    static DECLARED: OnceLock<Option<Regex>> = OnceLock::new();
    static LIST: OnceLock<Option<Regex>> = OnceLock::new();

    let mut info = ExportInfo::default();

    info.has_default = cached_regex(&DEFAULT, r"export\s+default\s+")
        .map(|re| re.is_match(source))
        .unwrap_or(false);

    if let Some(declared) = cached_regex(
        &DECLARED,
        r"export\s+(?:async\s+)?(?:function\s*\*?|const|let|class)\s*(\w+)",
    ) {
        info.named_exports.extend(
            declared
                .captures_iter(source)
                .filter_map(|caps| caps.get(1))
                .map(|m| m.as_str().to_string()),
        );
    }

    // export { A, B as C }, export { X as default }, export { default } from './X'
    if let Some(list) = cached_regex(&LIST, r"export\s*\{([^}]*)\}") {
        for caps in list.captures_iter(source) {
            let Some(body) = caps.get(1) else { continue };
            for item in body.as_str().split(',') {
                match item.split_whitespace().last().unwrap_or("") {
                    "" => {}
                    "default" => info.has_default = true,
                    exported => {
                        info.named_exports.insert(exported.to_string());
                    }
                }
            }
        }
    }
    info
}

/// Export info for every source file, keyed by root-relative `/` path.
pub fn index_exports(files: &[SourceFile]) -> BTreeMap<String, ExportInfo> {
    files
        .iter()
        .map(|file| (file.relative.clone(), export_info(&file.content)))
        .collect()
}

/// Lexically join `specifier` onto `base_dir`. `None` if it climbs above the root.
fn join_relative(base_dir: &str, specifier: &str) -> Option<String> {
    let mut segments: Vec<&str> = base_dir.split('/').filter(|s| !s.is_empty()).collect();
    for part in specifier.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    Some(segments.join("/"))
}

pub struct ExportContractFixer {
    packages: PackageConfig,
    tree: TreeConfig,
}

impl ExportContractFixer {
    pub fn new(packages: PackageConfig, tree: TreeConfig) -> Self {
        Self { packages, tree }
    }

    /// Indexed file that `specifier`, imported from `importer`, refers to.
    /// Package specifiers never resolve.
    pub fn resolve<'i>(
        &self,
        index: &'i BTreeMap<String, ExportInfo>,
        importer: &str,
        specifier: &str,
    ) -> Option<(&'i String, &'i ExportInfo)> {
        let bases: Vec<String> = if specifier.starts_with("./") || specifier.starts_with("../") {
            let dir = importer.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
            vec![join_relative(dir, specifier)?]
        } else if let Some(prefix) = self
            .packages
            .path_alias_prefixes
            .iter()
            .find(|prefix| specifier.starts_with(prefix.as_str()))
        {
            let rest = &specifier[prefix.len()..];
            [join_relative("src", rest), join_relative("", rest)]
                .into_iter()
                .flatten()
                .collect()
        } else {
            return None;
        };

        bases.iter().find_map(|base| {
            let mut candidates = vec![base.clone()];
            candidates.extend(RESOLVE_EXTENSIONS.iter().map(|ext| format!("{}.{}", base, ext)));
            candidates.extend(
                RESOLVE_EXTENSIONS
                    .iter()
                    .map(|ext| format!("{}/index.{}", base, ext)),
            );
            candidates
                .into_iter()
                .find_map(|candidate| index.get_key_value(&candidate))
        })
    }

    /// Rewrite the default imports in `file` that must be named imports.
    /// Returns the new content and the number of imports changed.
    pub fn rewrite_imports(
        &self,
        index: &BTreeMap<String, ExportInfo>,
        file: &SourceFile,
    ) -> (String, usize) {
        static IMPORT: OnceLock<Option<Regex>> = OnceLock::new();
        let Some(import) = cached_regex(&IMPORT, r#"import\s+(\w+)\s+from\s+(['"])([^'"]+)['"]"#)
        else {
            return (file.content.clone(), 0);
        };

        let mut rewritten = 0usize;
        let content = import.replace_all(&file.content, |caps: &Captures| {
            let original = caps[0].to_string();
            let (binding, quote, specifier) = (&caps[1], &caps[2], &caps[3]);
            let Some((target, info)) = self.resolve(index, &file.relative, specifier) else {
                return original;
            };
            if info.has_default || !info.named_exports.contains(binding) {
                return original;
            }
            tracing::debug!(file = %file.relative, target = %target, binding, "rewriting default import");
            rewritten += 1;
            format!("import {{ {} }} from {}{}{}", binding, quote, specifier, quote)
        });
        (content.into_owned(), rewritten)
    }

    /// Scan the tree once, then rewrite every mismatched import in place.
    pub fn fix_exports(&self, root: &Path) -> anyhow::Result<FixReport> {
        let files = source_files(root, &self.tree);
        let index = index_exports(&files);
        let mut report = FixReport::default();

        for file in &files {
            let (content, count) = self.rewrite_imports(&index, file);
            if count == 0 {
                continue;
            }
            write_atomic(&file.absolute, &content)?;
            report.files_rewritten += 1;
            report.imports_rewritten += count;
            tracing::info!(file = %file.relative, imports = count, "fixed import/export mismatch");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixer() -> ExportContractFixer {
        ExportContractFixer::new(PackageConfig::default(), TreeConfig::default())
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn read(root: &Path, rel: &str) -> String {
        fs::read_to_string(root.join(rel)).unwrap()
    }

    #[test]
    fn test_export_info_detection() {
        let info = export_info(
            "export function A() {}\nexport async function B() {}\nexport const C = 1;\nexport let D = 2;\nexport class E {}\nexport { F, G as H };\n",
        );
        assert!(!info.has_default);
        let names: Vec<&str> = info.named_exports.iter().map(String::as_str).collect();
        assert_eq!(names, vec!["A", "B", "C", "D", "E", "F", "H"]);

        assert!(export_info("export default function Page() {}").has_default);
        assert!(export_info("function X() {}\nexport { X as default };").has_default);
        assert!(export_info("export { default } from './Hero';").has_default);

        let renamed = export_info("export { default as Hero } from './Hero';");
        assert!(!renamed.has_default);
        assert!(renamed.named_exports.contains("Hero"));
    }

    #[test]
    fn test_barrel_reexporting_default_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "components/Hero/Hero.tsx",
            "export function Hero() {}
export default Hero;
",
        );
        write(
            dir.path(),
            "components/Hero/index.ts",
            "export { default } from './Hero';
export { Hero } from './Hero';
",
        );
        write(dir.path(), "app/page.tsx", "import Hero from '../components/Hero';
");
        let report = fixer().fix_exports(dir.path()).unwrap();
        assert_eq!(report.imports_rewritten, 0);
        assert_eq!(
            read(dir.path(), "app/page.tsx"),
            "import Hero from '../components/Hero';
"
        );
    }

    #[test]
    fn test_default_import_of_named_export_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "components/Button.ts", "export function Button(){}\n");
        write(
            dir.path(),
            "pages/index.ts",
            "import Button from \"../components/Button\"\nexport default function Home() { return Button; }\n",
        );
        write(dir.path(), "index.ts", "import Button from \"./components/Button\"\n");

        let report = fixer().fix_exports(dir.path()).unwrap();
        assert_eq!(
            report,
            FixReport {
                files_rewritten: 2,
                imports_rewritten: 2
            }
        );
        assert_eq!(
            read(dir.path(), "index.ts"),
            "import { Button } from \"./components/Button\"\n"
        );
        assert!(read(dir.path(), "pages/index.ts")
            .starts_with("import { Button } from \"../components/Button\"\n"));
    }

    #[test]
    fn test_file_with_default_export_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "components/Card.tsx",
            "export function Card() {}\nexport default Card;\n",
        );
        write(dir.path(), "app/page.tsx", "import Card from '../components/Card';\n");
        let report = fixer().fix_exports(dir.path()).unwrap();
        assert_eq!(report.files_rewritten, 0);
        assert_eq!(
            read(dir.path(), "app/page.tsx"),
            "import Card from '../components/Card';\n"
        );
    }

    #[test]
    fn test_missing_named_export_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "lib/util.ts", "export const helper = 1;\n");
        write(dir.path(), "app/page.tsx", "import Other from '../lib/util';\n");
        assert_eq!(fixer().fix_exports(dir.path()).unwrap().files_rewritten, 0);
    }

    #[test]
    fn test_package_imports_are_never_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        // A local file that happens to share the package's name and export.
        write(dir.path(), "clsx.ts", "export function clsx() {}\n");
        write(dir.path(), "a.ts", "import clsx from 'clsx';\n");
        assert_eq!(fixer().fix_exports(dir.path()).unwrap().files_rewritten, 0);
        assert_eq!(read(dir.path(), "a.ts"), "import clsx from 'clsx';\n");
    }

    #[test]
    fn test_alias_import_resolves_under_src_and_keeps_quotes() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "src/components/Navbar/index.tsx",
            "export const Navbar = () => null;\n",
        );
        write(
            dir.path(),
            "src/app/layout.tsx",
            "import Navbar from '@/components/Navbar';\nimport React from 'react';\n",
        );
        let report = fixer().fix_exports(dir.path()).unwrap();
        assert_eq!(report.imports_rewritten, 1);
        assert_eq!(
            read(dir.path(), "src/app/layout.tsx"),
            "import { Navbar } from '@/components/Navbar';\nimport React from 'react';\n"
        );
    }

    #[test]
    fn test_join_relative_refuses_to_leave_root() {
        assert_eq!(join_relative("pages", "../components/Button"), Some("components/Button".to_string()));
        assert_eq!(join_relative("", "./a/./b"), Some("a/b".to_string()));
        assert_eq!(join_relative("", "../outside"), None);
    }
}
