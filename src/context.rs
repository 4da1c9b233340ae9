//! # Context
//!
//! The process-wide registry of components and modules, and the crate's
//! entry point into the event loop. Grounded on
//! `examples/original_source/src/context.c` and `include/vde3/context.h`.
//!
//! The event loop itself is treated as an adapter over any reactor
//! delivering readiness and timeout callbacks. This crate's concrete
//! adapter *is* Tokio: `Context` is driven from whatever
//! single-threaded (current-thread) Tokio runtime the caller is already
//! running inside, and every component spawns its background work with
//! `tokio::task::spawn_local`-free plain `tokio::spawn` calls scoped to
//! that runtime.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::command::Command;
use crate::component::{Component, ComponentKind, KindOps};
use crate::error::{Result, Vde3Error};
use crate::module::{Module, ModuleRegistry};
use crate::signal::Signal;

/// Names that would collide with the control engine's own path
/// conventions.
const RESERVED_NAMES: [&str; 2] = ["context", "commands"];

struct ContextInner {
    modules: AsyncMutex<ModuleRegistry>,
    components: AsyncMutex<IndexMap<String, Arc<Component>>>,
    initialized: AtomicBool,
}

/// A VDE3 runtime instance: an ordered registry of components plus the
/// module registry that instantiates them.
#[derive(Clone)]
pub struct Context(Arc<ContextInner>);

impl Context {
    /// `vde_context_new`: allocate an uninitialized context.
    pub fn new() -> Context {
        Context(Arc::new(ContextInner {
            modules: AsyncMutex::new(ModuleRegistry::new()),
            components: AsyncMutex::new(IndexMap::new()),
            initialized: AtomicBool::new(false),
        }))
    }

    /// `vde_context_init`: register the built-in modules and scan
    /// `module_paths` (non-recursively) for additional
    /// `*.so` modules. Asserts the context has not already been
    /// initialized.
    pub async fn init(&self, module_paths: &[PathBuf]) -> Result<()> {
        if self.0.initialized.swap(true, Ordering::SeqCst) {
            return Err(Vde3Error::InvalidArgument("context already initialized".into()));
        }

        {
            let mut modules = self.0.modules.lock().await;
            crate::engine::hub::register(&mut modules)?;
            crate::engine::ctrl::register(&mut modules)?;
            crate::transport::datagram::register(&mut modules)?;
            crate::conn_manager::register(&mut modules)?;
        }

        for path in module_paths {
            let mut modules = self.0.modules.lock().await;
            let loaded = modules.scan_directory(path);
            info!("loaded {} module(s) from {:?}", loaded, path);
        }

        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.0.initialized.load(Ordering::SeqCst)
    }

    fn require_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(Vde3Error::InvalidArgument("context not initialized".into()));
        }
        Ok(())
    }

    /// Register an additional module directly (bypassing `.so` discovery),
    /// the path the crate's own built-in modules use.
    pub async fn register_module(&self, module: Module) -> Result<()> {
        self.0.modules.lock().await.register(module)
    }

    /// `vde_context_new_component`. Forbids reserved names, requires
    /// uniqueness, looks up the module, builds the kind-specific ops with
    /// the caller's `args`, duplicates the module's signal templates and
    /// clones its command templates, and stores the component at refcount
    /// 1.
    pub async fn new_component(
        &self,
        kind: ComponentKind,
        family: &str,
        name: &str,
        args: Value,
    ) -> Result<Arc<Component>> {
        self.require_initialized()?;

        if RESERVED_NAMES.contains(&name) {
            return Err(Vde3Error::InvalidArgument(format!("component name {name:?} is reserved")));
        }

        if self.0.components.lock().await.contains_key(name) {
            return Err(Vde3Error::AlreadyExists(format!("component {name} already exists")));
        }

        // Build the kind-specific ops *before* taking the components lock: a
        // wiring module (the connection manager) resolves peer components by
        // name through `self`, which would deadlock against a held lock.
        let (commands, signals, factory) = {
            let modules = self.0.modules.lock().await;
            let module = modules
                .lookup(kind, family)
                .ok_or_else(|| Vde3Error::NotFound(format!("module {}/{family}", kind.as_str())))?;
            (module.commands.clone(), module.duplicate_signals(), module.factory.clone())
        };
        let ops = factory.build(self, args).await?;

        let mut components = self.0.components.lock().await;
        if components.contains_key(name) {
            return Err(Vde3Error::AlreadyExists(format!("component {name} already exists")));
        }

        let component = Component::new(name, kind, family, ops, commands, signals)?;
        if let Some(engine_ops) = component.engine_ops() {
            engine_ops.bind_component(&component);
        }
        components.insert(name.to_string(), component.clone());
        Ok(component)
    }

    pub async fn get_component(&self, name: &str) -> Option<Arc<Component>> {
        self.0.components.lock().await.get(name).cloned()
    }

    /// `vde_context_del_component`. Rejects with `Busy` unless the
    /// component's refcount is exactly 1 (no other component holds it),
    /// then finalizes and drops it.
    pub async fn delete_component(&self, name: &str) -> Result<()> {
        let mut components = self.0.components.lock().await;
        let component = components
            .get(name)
            .ok_or_else(|| Vde3Error::NotFound(format!("component {name}")))?
            .clone();

        if component.refcount() > 1 {
            return Err(Vde3Error::Busy(format!(
                "component {name} still referenced ({} holders)",
                component.refcount()
            )));
        }

        component.fini().await;
        components.shift_remove(name);
        Ok(())
    }

    /// Components in insertion order — used to replay configuration
    /// deterministically.
    pub async fn component_names(&self) -> Vec<String> {
        self.0.components.lock().await.keys().cloned().collect()
    }

    pub async fn component_count(&self) -> usize {
        self.0.components.lock().await.len()
    }

    /// `vde_context_fini`: finalize every remaining component in insertion
    /// order.
    pub async fn fini(&self) {
        let names = self.component_names().await;
        for name in names {
            if let Err(e) = self.delete_component(&name).await {
                warn!("component {name} could not be finalized cleanly: {e}");
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

/// A convenience for tests and the CLI: build and initialize a context
/// whose module search path includes `extra_paths` in addition to the
/// built-in modules.
pub async fn bootstrap(extra_paths: &[&Path]) -> Result<Context> {
    let ctx = Context::new();
    let owned: Vec<PathBuf> = extra_paths.iter().map(|p| p.to_path_buf()).collect();
    ctx.init(&owned).await?;
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserved_names_are_refused() {
        let ctx = bootstrap(&[]).await.unwrap();
        let err = ctx
            .new_component(ComponentKind::Engine, "hub", "context", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Vde3Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn duplicate_names_are_refused() {
        let ctx = bootstrap(&[]).await.unwrap();
        ctx.new_component(ComponentKind::Engine, "hub", "e1", Value::Null)
            .await
            .unwrap();
        let err = ctx
            .new_component(ComponentKind::Engine, "hub", "e1", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Vde3Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn double_init_is_rejected() {
        let ctx = Context::new();
        ctx.init(&[]).await.unwrap();
        assert!(ctx.init(&[]).await.is_err());
    }

    #[tokio::test]
    async fn insertion_order_is_preserved() {
        let ctx = bootstrap(&[]).await.unwrap();
        ctx.new_component(ComponentKind::Engine, "hub", "e1", Value::Null)
            .await
            .unwrap();
        ctx.new_component(ComponentKind::Engine, "hub", "e2", Value::Null)
            .await
            .unwrap();
        assert_eq!(ctx.component_names().await, vec!["e1".to_string(), "e2".to_string()]);
    }
}
