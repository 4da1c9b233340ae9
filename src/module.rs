//! # Module registry
//!
//! A `Module` is a dynamically-loadable descriptor `(kind, family,
//! component-ops, kind-specific-ops)` discovered by scanning a directory of
//! shared objects for a well-known exported symbol. Grounded on
//! `examples/original_source/src/module.c` and
//! `include/vde3/module.h`/`priv/module.h`.
//!
//! module loading from shared libraries is out of scope as a
//! feature surface — only the registry interface is specified. This module
//! implements that interface in full (register/lookup/reject-duplicates)
//! plus a best-effort `*.so` directory scan built on `libloading`, the way
//! a real plugin host would, but the three modules this crate actually
//! ships (`hub`, `ctrl`, the vde2-compatible datagram transport, and the
//! default connection manager) are registered in-process at context-init
//! time rather than loaded from disk — see `Context::init`.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::command::Command;
use crate::component::{ComponentKind, KindOps};
use crate::error::{Result, Vde3Error};
use crate::signal::Signal;

/// Builds the kind-specific operations table for one component instance,
/// given that component's construction-time arguments. `ctx` lets a wiring module (the
/// connection manager, which needs `Arc<Component>` handles on an already
/// constructed transport and engine) resolve peer components by name — the
/// Rust equivalent of the variadic tail carrying those pointers directly in
/// the C source.
#[async_trait]
pub trait ModuleFactory: Send + Sync {
    async fn build(&self, ctx: &crate::context::Context, args: Value) -> Result<KindOps>;
}

/// A registered module: the template commands/signals every component of
/// this `(kind, family)` starts with, plus the factory that builds its
/// kind-specific operations.
pub struct Module {
    pub kind: ComponentKind,
    pub family: String,
    pub commands: Vec<Command>,
    pub signals: Vec<Signal>,
    pub factory: Arc<dyn ModuleFactory>,
}

impl Module {
    pub fn new(
        kind: ComponentKind,
        family: impl Into<String>,
        commands: Vec<Command>,
        signals: Vec<Signal>,
        factory: Arc<dyn ModuleFactory>,
    ) -> Module {
        Module {
            kind,
            family: family.into(),
            commands,
            signals,
            factory,
        }
    }

    /// Duplicate this module's signal templates for a fresh component.
    pub fn duplicate_signals(&self) -> Vec<Signal> {
        self.signals.iter().map(Signal::dup).collect()
    }
}

/// The well-known symbol a module shared object must export. It must
/// return a heap-allocated `Module` the registry takes ownership of.
pub const MODULE_ENTRY_SYMBOL: &[u8] = b"vde3_module_entry";

#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<(ComponentKind, String), Module>,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry::default()
    }

    /// Register a module. Rejected if another module of the same
    /// `(kind, family)` already exists.
    pub fn register(&mut self, module: Module) -> Result<()> {
        let key = (module.kind, module.family.clone());
        if self.modules.contains_key(&key) {
            return Err(Vde3Error::AlreadyExists(format!(
                "module {}/{} already registered",
                module.kind.as_str(),
                module.family
            )));
        }
        self.modules.insert(key, module);
        Ok(())
    }

    pub fn lookup(&self, kind: ComponentKind, family: &str) -> Option<&Module> {
        self.modules.get(&(kind, family.to_string()))
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Non-recursively scan `dir` for `*.so` files, dlopen each one,
    /// resolve [`MODULE_ENTRY_SYMBOL`], and register whatever `Module` it
    /// produces. Failures (unreadable file, missing symbol, duplicate
    /// module) are logged and the file is skipped — module discovery never
    /// aborts the scan.
    ///
    /// Returns the number of modules registered.
    pub fn scan_directory(&mut self, dir: &Path) -> usize {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("module search path {:?} unreadable: {}", dir, e);
                return 0;
            }
        };

        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension() != Some(OsStr::new("so")) {
                continue;
            }
            match self.load_one(&path) {
                Ok(()) => loaded += 1,
                Err(e) => warn!("skipping module {:?}: {}", path, e),
            }
        }
        loaded
    }

    fn load_one(&mut self, path: &Path) -> Result<()> {
        // SAFETY: loading arbitrary shared objects is inherently unsafe;
        // this mirrors dlopen()'s own contract. The caller is trusted to
        // point the module search path at vetted modules only.
        let lib = unsafe { libloading::Library::new(path) }
            .map_err(|e| Vde3Error::Protocol(format!("dlopen failed: {e}")))?;
        let module = unsafe {
            let entry: libloading::Symbol<unsafe extern "C" fn() -> *mut Module> =
                lib.get(MODULE_ENTRY_SYMBOL)
                    .map_err(|e| Vde3Error::Protocol(format!("missing entry symbol: {e}")))?;
            let raw = entry();
            if raw.is_null() {
                return Err(Vde3Error::Protocol("module entry returned null".into()));
            }
            Box::from_raw(raw)
        };
        debug!("loaded module {}/{} from {:?}", module.kind.as_str(), module.family, path);
        // Keep the library mapped for the process lifetime: the Module's
        // vtables point into it.
        std::mem::forget(lib);
        self.register(*module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::EngineOps;

    struct NopFactory;
    #[async_trait]
    impl ModuleFactory for NopFactory {
        async fn build(&self, _ctx: &crate::context::Context, _args: Value) -> Result<KindOps> {
            struct Nop;
            #[async_trait]
            impl EngineOps for Nop {
                async fn new_connection(
                    &self,
                    _c: &Arc<crate::component::Component>,
                    _conn: crate::connection::Connection,
                ) -> Result<()> {
                    Ok(())
                }
                fn as_any(&self) -> &dyn std::any::Any {
                    self
                }
            }
            Ok(KindOps::Engine(Arc::new(Nop)))
        }
    }

    #[test]
    fn duplicate_family_rejected() {
        let mut registry = ModuleRegistry::new();
        let m1 = Module::new(ComponentKind::Engine, "hub", vec![], vec![], Arc::new(NopFactory));
        let m2 = Module::new(ComponentKind::Engine, "hub", vec![], vec![], Arc::new(NopFactory));
        registry.register(m1).unwrap();
        let err = registry.register(m2).unwrap_err();
        assert!(matches!(err, Vde3Error::AlreadyExists(_)));
    }

    #[test]
    fn lookup_misses_return_none() {
        let registry = ModuleRegistry::new();
        assert!(registry.lookup(ComponentKind::Engine, "hub").is_none());
    }

    #[test]
    fn scan_of_missing_directory_logs_and_returns_zero() {
        let mut registry = ModuleRegistry::new();
        let loaded = registry.scan_directory(Path::new("/nonexistent/vde3/modules"));
        assert_eq!(loaded, 0);
    }
}
