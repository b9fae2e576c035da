//! Render module references and convention detection.
//!
//! A module's convention is never guessed from its source text. It comes from
//! an explicit override, the file extension, or the nearest `package.json`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use deno_core::ModuleSpecifier;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SsrError;

/// Extensions the loader accepts.
pub(crate) const MODULE_EXTENSIONS: &[&str] = &["js", "mjs", "cjs"];

/// How a render module exposes its `render` function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleKind {
    /// `module.exports = { render }`
    #[serde(rename = "commonjs")]
    CommonJs,
    /// `export function render(page) {}`
    #[serde(rename = "module")]
    EsModule,
}

impl ModuleKind {
    /// Name in the `package.json` `type` vocabulary.
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleKind::CommonJs => "commonjs",
            ModuleKind::EsModule => "module",
        }
    }

    /// Determine the convention of a file from its extension or manifest.
    pub fn detect(path: &Path) -> Result<Self, SsrError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("mjs") => return Ok(ModuleKind::EsModule),
            Some("cjs") => return Ok(ModuleKind::CommonJs),
            _ => {}
        }

        // Only the nearest manifest counts, like Node.
        for dir in path.ancestors().skip(1) {
            let manifest = dir.join("package.json");
            if !manifest.is_file() {
                continue;
            }
            return package_type(&manifest);
        }

        Ok(ModuleKind::CommonJs)
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "commonjs" | "cjs" => Ok(ModuleKind::CommonJs),
            "module" | "esm" | "es" => Ok(ModuleKind::EsModule),
            other => Err(format!(
                "unknown module kind '{}', expected commonjs|cjs|module|esm",
                other
            )),
        }
    }
}

#[derive(Deserialize)]
struct PackageManifest {
    #[serde(rename = "type")]
    kind: Option<String>,
}

fn package_type(manifest: &Path) -> Result<ModuleKind, SsrError> {
    let failed = |message: String| SsrError::ModuleLoadFailed {
        reference: manifest.display().to_string(),
        message,
    };

    let raw = fs::read_to_string(manifest).map_err(|e| failed(e.to_string()))?;
    let parsed: PackageManifest =
        serde_json::from_str(&raw).map_err(|e| failed(format!("invalid package.json: {}", e)))?;

    Ok(match parsed.kind.as_deref() {
        Some("module") => ModuleKind::EsModule,
        _ => ModuleKind::CommonJs,
    })
}

/// A configured reference to a render module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    path: PathBuf,
    kind: Option<ModuleKind>,
}

impl ModuleRef {
    /// Reference a module by path or `file://` URL; the convention is detected.
    pub fn new(reference: impl AsRef<str>) -> Self {
        let reference = reference.as_ref();
        let path = ModuleSpecifier::parse(reference)
            .ok()
            .filter(|url| url.scheme() == "file")
            .and_then(|url| url.to_file_path().ok())
            .unwrap_or_else(|| PathBuf::from(reference));

        Self { path, kind: None }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: None,
        }
    }

    /// Force a convention instead of detecting it.
    pub fn with_kind(mut self, kind: ModuleKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> Option<ModuleKind> {
        self.kind
    }

    /// Canonical path of an existing module file.
    pub(crate) fn canonical_path(&self) -> Result<PathBuf, SsrError> {
        let not_found = |reason: String| SsrError::ModuleNotFound {
            reference: self.to_string(),
            reason,
        };

        let canonical = self
            .path
            .canonicalize()
            .map_err(|e| not_found(e.to_string()))?;

        if !canonical.is_file() {
            return Err(not_found("not a file".to_string()));
        }

        let extension = canonical.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !MODULE_EXTENSIONS.contains(&extension) {
            return Err(not_found(format!(
                "unsupported extension, expected one of {:?}",
                MODULE_EXTENSIONS
            )));
        }

        Ok(canonical)
    }
}

impl fmt::Display for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Turn a CommonJS source into an ES module whose default export is
/// `module.exports`.
///
/// The factory is compiled through indirect `eval`, so the source runs as
/// sloppy-mode code unless it opts into `"use strict"` itself. The function
/// header shares the first source line and `sourceURL` names the file, so
/// stack traces match the original.
pub(crate) fn wrap_commonjs(source: &str, path: &Path) -> String {
    let source = match source.strip_prefix("#!") {
        Some(rest) => format!("//{}", rest),
        None => source.to_string(),
    };

    let source_url = ModuleSpecifier::from_file_path(path)
        .map(|url| url.to_string())
        .unwrap_or_else(|_| path.display().to_string());
    let factory = js_literal(&format!(
        "(function (exports, require, module, __filename, __dirname) {{ {source}\n}})\n//# sourceURL={source_url}"
    ));
    let filename = js_literal(&path.display().to_string());
    let dirname = js_literal(
        &path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
    );

    format!(
        "const module = {{ exports: {{}} }};\n\
         const __ssr_require = (id) => {{ throw new Error(`require(${{JSON.stringify(id)}}) is not available during SSR; bundle dependencies into the render module`); }};\n\
         const __ssr_factory = (0, eval)({factory});\n\
         __ssr_factory.call(module.exports, module.exports, __ssr_require, module, {filename}, {dirname});\n\
         export default module.exports;\n"
    )
}

fn js_literal(value: &str) -> String {
    Value::from(value).to_string()
}
