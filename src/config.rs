//! Context configuration

use std::path::PathBuf;

use crate::vm::stack::MAX_CALL_DEPTH;

/// Default number of recycled slots kept per type
pub const DEFAULT_POOL_CAP: usize = 20;

/// Default optimisation level
pub const DEFAULT_OPT_LEVEL: u8 = 3;

/// Heap limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Maximum number of live objects; `None` means unbounded
    pub max_objects: Option<usize>,
    /// Maximum length of a type's free-list
    pub pool_cap: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            max_objects: None,
            pool_cap: DEFAULT_POOL_CAP,
        }
    }
}

/// Configuration of a [`Context`](crate::Context)
#[derive(Debug, Clone)]
pub struct Config {
    /// Optimisation level; at 3 and above the assembler folds builtin names
    pub opt_level: u8,
    /// Skip the default bindings of the top-level variable table
    pub no_default: bool,
    /// Program arguments, exposed as `_args_`
    pub argv: Vec<String>,
    /// Initial working directory, exposed as `_cwd_`
    pub cwd: PathBuf,
    /// Call stack depth limit
    pub max_recursion: usize,
    pub heap: HeapConfig,
    /// Render tracebacks with ANSI colours
    pub color: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            opt_level: DEFAULT_OPT_LEVEL,
            no_default: false,
            argv: Vec::new(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            max_recursion: MAX_CALL_DEPTH,
            heap: HeapConfig::default(),
            color: false,
        }
    }
}

impl Config {
    pub fn with_opt_level(mut self, level: u8) -> Self {
        self.opt_level = level;
        self
    }

    pub fn with_no_default(mut self, no_default: bool) -> Self {
        self.no_default = no_default;
        self
    }

    pub fn with_argv<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Lower the call depth limit; values above the hard maximum are clamped
    pub fn with_max_recursion(mut self, depth: usize) -> Self {
        self.max_recursion = depth.min(MAX_CALL_DEPTH);
        self
    }

    pub fn with_max_objects(mut self, max: usize) -> Self {
        self.heap.max_objects = Some(max);
        self
    }

    pub fn with_pool_cap(mut self, cap: usize) -> Self {
        self.heap.pool_cap = cap;
        self
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.opt_level, 3);
        assert!(!config.no_default);
        assert_eq!(config.max_recursion, 1000);
        assert_eq!(config.heap.pool_cap, 20);
        assert!(config.heap.max_objects.is_none());
    }

    #[test]
    fn test_builders() {
        let config = Config::default()
            .with_argv(["a", "b"])
            .with_cwd("/tmp")
            .with_max_recursion(5000)
            .with_max_objects(64)
            .with_no_default(true);
        assert_eq!(config.argv, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(config.cwd, PathBuf::from("/tmp"));
        assert_eq!(config.max_recursion, 1000);
        assert_eq!(config.heap.max_objects, Some(64));
        assert!(config.no_default);
    }
}
