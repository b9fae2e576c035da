//! Module loader for render modules.
//!
//! Keeps every import inside the sandbox root, blocks remote specifiers, and
//! rewrites CommonJS files into ES modules so both conventions go through the
//! same module map.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use deno_core::{
    anyhow::{anyhow, Error},
    ModuleLoadResponse, ModuleLoader, ModuleSource, ModuleSourceCode, ModuleSpecifier,
    ModuleType, RequestedModuleType, ResolutionKind,
};

use crate::module::{wrap_commonjs, ModuleKind, MODULE_EXTENSIONS};

/// Explicit convention overrides, keyed by canonical path.
///
/// Shared between the runtime (which registers overrides before loading) and
/// the loader (which consults them when reading a file).
pub(crate) type KindOverrides = Rc<RefCell<HashMap<PathBuf, ModuleKind>>>;

/// A module loader that restricts all imports to a single directory tree.
pub struct RenderModuleLoader {
    root: PathBuf,
    overrides: KindOverrides,
}

impl RenderModuleLoader {
    /// `root` must be a canonical directory.
    pub(crate) fn new(root: PathBuf, overrides: KindOverrides) -> Self {
        Self { root, overrides }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Symlinks are resolved before the prefix check.
    pub(crate) fn is_path_allowed(&self, path: &Path) -> bool {
        match path.canonicalize() {
            Ok(canonical) => canonical.starts_with(&self.root),
            Err(_) => false,
        }
    }

    fn is_extension_allowed(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| MODULE_EXTENSIONS.contains(&e))
    }

    fn kind_of(&self, path: &Path) -> Result<ModuleKind, Error> {
        if let Some(kind) = self.overrides.borrow().get(path) {
            return Ok(*kind);
        }
        ModuleKind::detect(path).map_err(Error::from)
    }

    fn read_module(&self, specifier: &ModuleSpecifier) -> Result<ModuleSource, Error> {
        let path = specifier
            .to_file_path()
            .map_err(|_| anyhow!("Invalid file path: {}", specifier))?;

        if !self.is_path_allowed(&path) {
            return Err(anyhow!("Access denied: {}", path.display()));
        }
        if !Self::is_extension_allowed(&path) {
            return Err(anyhow!("Invalid extension: {}", path.display()));
        }

        let path = path.canonicalize()?;
        let source = std::fs::read_to_string(&path)
            .map_err(|e| anyhow!("Failed to read '{}': {}", path.display(), e))?;

        let code = match self.kind_of(&path)? {
            ModuleKind::EsModule => source,
            ModuleKind::CommonJs => wrap_commonjs(&source, &path),
        };

        tracing::trace!(module = %specifier, "module source loaded");
        Ok(ModuleSource::new(
            ModuleType::JavaScript,
            ModuleSourceCode::String(code.into()),
            specifier,
            None,
        ))
    }
}

impl ModuleLoader for RenderModuleLoader {
    fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, Error> {
        if ["http://", "https://", "data:", "blob:"]
            .iter()
            .any(|scheme| specifier.starts_with(scheme))
        {
            return Err(anyhow!("Remote imports are forbidden: {}", specifier));
        }

        let resolved = if specifier.starts_with("./") || specifier.starts_with("../") {
            let referrer_url = ModuleSpecifier::parse(referrer)
                .map_err(|e| anyhow!("Invalid referrer '{}': {}", referrer, e))?;
            referrer_url
                .join(specifier)
                .map_err(|e| anyhow!("Failed to resolve '{}': {}", specifier, e))?
        } else if specifier.starts_with("file://") {
            ModuleSpecifier::parse(specifier)
                .map_err(|e| anyhow!("Invalid file URL '{}': {}", specifier, e))?
        } else if specifier.starts_with('/') {
            ModuleSpecifier::from_file_path(specifier)
                .map_err(|_| anyhow!("Invalid absolute path: {}", specifier))?
        } else {
            // Bare specifiers name files under the root; there is no package lookup.
            ModuleSpecifier::from_file_path(self.root.join(specifier))
                .map_err(|_| anyhow!("Invalid bare specifier: {}", specifier))?
        };

        if resolved.scheme() != "file" {
            return Err(anyhow!("Only file:// URLs allowed, got: {}", resolved.scheme()));
        }

        let path = resolved
            .to_file_path()
            .map_err(|_| anyhow!("Failed to convert URL to path: {}", resolved))?;

        if !self.is_path_allowed(&path) {
            return Err(anyhow!(
                "Access denied: '{}' is outside the sandbox root",
                path.display()
            ));
        }

        if !Self::is_extension_allowed(&path) {
            return Err(anyhow!(
                "Only .js, .mjs and .cjs files allowed, got: {}",
                path.display()
            ));
        }

        Ok(resolved)
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        ModuleLoadResponse::Sync(self.read_module(module_specifier))
    }
}
