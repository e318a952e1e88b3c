//! StructZone struct redzone sanitizer
//!
//! A module transformation that detects intra-object buffer overflows
//! between adjacent members of a struct. For every identified struct it
//! synthesizes an "inflated" twin with a one-byte redzone before the first
//! member and after every member, rewrites all code onto the inflated
//! layouts, and instruments every load and store with a runtime check.
//! The instrumented module links against the `structzone-runtime` crate,
//! which aborts the program on any access that touches a redzone byte.
//!
//! The transformation runs in five phases over one module:
//!
//! 1. [`layout`] builds the struct layout model (two passes, handling
//!    self-referential types);
//! 2. [`signatures`] replaces struct-mentioning function signatures with
//!    inflated twins and redirects all call sites;
//! 3. [`rewrite`] rewrites function bodies instruction by instruction,
//!    scaling heap allocation sizes;
//! 4. [`signatures`] synthesizes inflation/deflation wrappers at the
//!    program↔library boundary (and around `main`);
//! 5. [`hooks`] registers redzones with the runtime and inserts access
//!    checks.
//!
//! Setting the `STRUCTZONE_DUMP_IR` environment variable to a path prefix
//! writes a textual IR snapshot after each phase, which is the first thing
//! to reach for when a transformed module misbehaves.

pub mod error;
pub mod hooks;
pub mod inflate;
pub mod layout;
pub mod logging;
pub mod rewrite;
pub mod signatures;

pub use error::TransformError;
pub use layout::{FieldInfo, StructInfo, StructMap};

use fxhash::FxHashMap;
use ir::{IrFunctionId, IrModule, ModulePass, PassError, PassRegistry, PassResult};
use log::{info, warn};
use rewrite::HeapSite;

/// Bytes per redzone member.
pub const REDZONE_SIZE: u64 = 1;

/// Suffix of every synthesized type and function name. Reserved: input
/// modules must not contain it.
pub const INFLATED_SUFFIX: &str = ".inflated";

/// Pipeline name the pass registers under.
pub const PIPELINE_NAME: &str = "structzone-sanitizer";

/// `<name>.inflated`
pub fn inflated_name(name: &str) -> String {
    format!("{}{}", name, INFLATED_SUFFIX)
}

/// Whether a name lies in the reserved inflated namespace.
pub fn is_inflated_name(name: &str) -> bool {
    name.ends_with(INFLATED_SUFFIX)
}

/// The struct redzone sanitizer pass.
pub struct StructZoneSanitizer {
    dump_prefix: Option<String>,
}

impl StructZoneSanitizer {
    pub fn new() -> Self {
        Self {
            dump_prefix: std::env::var("STRUCTZONE_DUMP_IR").ok(),
        }
    }

    /// Transform one module. This is the typed entry point; the
    /// [`ModulePass`] impl wraps it for pipeline use.
    pub fn run(&mut self, module: &mut IrModule) -> Result<PassResult, TransformError> {
        info!("structzone: transforming module {}", module.name);
        let mut result = PassResult::unchanged();

        // Phase 1: struct layout model
        let map = StructMap::build(module)?;
        result.count("structs_inflated", map.original_count());
        self.snapshot(module, "layout");

        // Phase 2: function signatures
        let plan = signatures::transform_signatures(module, &map)?;
        result.count("library_wrappers", plan.library_wrappers.len());
        self.snapshot(module, "signatures");

        // Phase 3: instruction rewriting
        let callee_names = callee_names(module);
        let mut heap_sites: FxHashMap<IrFunctionId, Vec<HeapSite>> = FxHashMap::default();
        let mut heap_site_count = 0;
        for fid in module.sorted_function_ids() {
            let func = module.functions.get_mut(&fid).unwrap();
            let sites = rewrite::rewrite_function(func, &map, &callee_names)?;
            if !sites.is_empty() {
                heap_site_count += sites.len();
                heap_sites.insert(fid, sites);
            }
        }
        result.count("heap_sites_scaled", heap_site_count);
        self.snapshot(module, "rewrite");

        // Phase 4: boundary wrappers
        signatures::synthesize_wrappers(module, &map, &plan)?;
        self.snapshot(module, "wrappers");

        // Phase 5: runtime hooks
        let runtime = hooks::declare_runtime(module);
        let hook_stats = hooks::insert_hooks(module, &map, &heap_sites, &runtime)?;
        result.count("redzones_registered", hook_stats.redzones_registered);
        result.count("checks_inserted", hook_stats.checks_inserted);
        result.count("heap_frees_instrumented", hook_stats.heap_frees_instrumented);
        self.snapshot(module, "hooks");

        info!(
            "structzone: done ({} structs, {} redzones, {} checks)",
            map.original_count(),
            hook_stats.redzones_registered,
            hook_stats.checks_inserted
        );
        Ok(result)
    }

    /// Advisory IR snapshot after a transformation step.
    fn snapshot(&self, module: &IrModule, step: &str) {
        let Some(prefix) = &self.dump_prefix else {
            return;
        };
        let path = format!("{}.{}.ir", prefix, step);
        if let Err(err) = std::fs::write(&path, ir::dump::dump_module(module)) {
            warn!("could not write IR snapshot {}: {}", path, err);
        }
    }
}

impl Default for StructZoneSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ModulePass for StructZoneSanitizer {
    fn name(&self) -> &'static str {
        PIPELINE_NAME
    }

    fn run_on_module(&mut self, module: &mut IrModule) -> Result<PassResult, PassError> {
        self.run(module).map_err(|e| Box::new(e) as PassError)
    }
}

/// Function-id → symbol-name table covering defined and external
/// functions, used by the rewriter to recognize allocators.
fn callee_names(module: &IrModule) -> FxHashMap<IrFunctionId, String> {
    let mut names = FxHashMap::default();
    for (id, func) in &module.functions {
        names.insert(*id, func.name.clone());
    }
    for (id, ext) in &module.extern_functions {
        names.insert(*id, ext.name.clone());
    }
    names
}

/// Register the sanitizer in a pass registry under [`PIPELINE_NAME`].
pub fn register_passes(registry: &mut PassRegistry) {
    registry.register(PIPELINE_NAME, || Box::new(StructZoneSanitizer::new()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inflated_name_round_trip() {
        assert_eq!(inflated_name("simple"), "simple.inflated");
        assert!(is_inflated_name(&inflated_name("simple")));
        assert!(!is_inflated_name("simple"));
    }

    #[test]
    fn test_registered_under_pipeline_name() {
        let mut registry = PassRegistry::new();
        register_passes(&mut registry);
        let pass = registry.create(PIPELINE_NAME).unwrap();
        assert_eq!(pass.name(), PIPELINE_NAME);
        assert!(registry.create("no-such-pass").is_none());
    }
}
