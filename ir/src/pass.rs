//! Module Passes
//!
//! Transformations over whole modules are organized into passes. A pass can
//! fail (malformed input IR is an error, not a panic), so `run_on_module`
//! returns a `Result`. The [`PassRegistry`] maps pipeline name strings to
//! pass constructors, which is how embedders request passes by name.

use super::IrModule;
use log::{debug, info};
use std::collections::HashMap;
use std::error::Error;

/// Error type shared by all passes
pub type PassError = Box<dyn Error + Send + Sync>;

/// Module pass trait
pub trait ModulePass {
    /// Get the name of this pass
    fn name(&self) -> &'static str;

    /// Run the pass on a module
    fn run_on_module(&mut self, module: &mut IrModule) -> Result<PassResult, PassError>;
}

/// Result of a pass
#[derive(Debug, Clone, Default)]
pub struct PassResult {
    /// Whether the IR was modified
    pub modified: bool,

    /// Named statistics
    pub stats: HashMap<String, usize>,
}

impl PassResult {
    /// Create a result indicating no changes
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Create a result indicating changes
    pub fn changed() -> Self {
        Self {
            modified: true,
            stats: HashMap::new(),
        }
    }

    /// Bump a named statistic
    pub fn count(&mut self, stat: &str, n: usize) {
        if n > 0 {
            self.modified = true;
            *self.stats.entry(stat.to_string()).or_insert(0) += n;
        }
    }

    /// Combine results
    pub fn combine(mut self, other: PassResult) -> Self {
        self.modified |= other.modified;
        for (key, value) in other.stats {
            *self.stats.entry(key).or_insert(0) += value;
        }
        self
    }
}

/// Runs a sequence of passes over a module, in order, once each.
///
/// Passes here are whole-module transformations, not fixpoint cleanups;
/// running one twice is not generally meaningful (a layout transformation
/// applied twice would transform its own output).
pub struct PassManager {
    passes: Vec<Box<dyn ModulePass>>,
}

impl PassManager {
    /// Create a new pass manager
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Add a pass to the manager
    pub fn add_pass<P: ModulePass + 'static>(&mut self, pass: P) {
        self.passes.push(Box::new(pass));
    }

    /// Add an already-boxed pass
    pub fn add_boxed_pass(&mut self, pass: Box<dyn ModulePass>) {
        self.passes.push(pass);
    }

    /// Run all passes on a module, stopping at the first failure
    pub fn run(&mut self, module: &mut IrModule) -> Result<PassResult, PassError> {
        let mut total = PassResult::unchanged();
        for pass in &mut self.passes {
            info!("running pass {}", pass.name());
            let result = pass.run_on_module(module)?;
            debug!(
                "pass {} finished (modified: {}, stats: {:?})",
                pass.name(),
                result.modified,
                result.stats
            );
            total = total.combine(result);
        }
        Ok(total)
    }
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Factory for a registered pass
pub type PassFactory = fn() -> Box<dyn ModulePass>;

/// Registry mapping pipeline name strings to pass constructors.
pub struct PassRegistry {
    factories: HashMap<String, PassFactory>,
}

impl PassRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a pass under a pipeline name. Re-registering a name
    /// replaces the previous factory.
    pub fn register(&mut self, name: impl Into<String>, factory: PassFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Instantiate the pass registered under `name`
    pub fn create(&self, name: &str) -> Option<Box<dyn ModulePass>> {
        self.factories.get(name).map(|factory| factory())
    }

    /// Build a pass manager from a comma-separated pipeline description
    pub fn parse_pipeline(&self, pipeline: &str) -> Result<PassManager, String> {
        let mut manager = PassManager::new();
        for name in pipeline.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let pass = self
                .create(name)
                .ok_or_else(|| format!("unknown pass name '{}'", name))?;
            manager.add_boxed_pass(pass);
        }
        Ok(manager)
    }
}

impl Default for PassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RenamePass;

    impl ModulePass for RenamePass {
        fn name(&self) -> &'static str {
            "rename"
        }

        fn run_on_module(&mut self, module: &mut IrModule) -> Result<PassResult, PassError> {
            module.name.push_str(".renamed");
            Ok(PassResult::changed())
        }
    }

    #[test]
    fn test_pass_manager_runs_in_order() {
        let mut module = IrModule::new("m");
        let mut manager = PassManager::new();
        manager.add_pass(RenamePass);
        manager.add_pass(RenamePass);
        let result = manager.run(&mut module).unwrap();
        assert!(result.modified);
        assert_eq!(module.name, "m.renamed.renamed");
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = PassRegistry::new();
        registry.register("rename", || Box::new(RenamePass));
        assert!(registry.create("rename").is_some());
        assert!(registry.create("missing").is_none());
        assert!(registry.parse_pipeline("rename, rename").is_ok());
        assert!(registry.parse_pipeline("rename, nope").is_err());
    }
}
