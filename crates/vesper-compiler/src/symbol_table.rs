//! Variable scopes and free-variable resolution.

use ahash::AHashMap;

/// Where a resolved variable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Local,
    Global,
    Free,
}

/// A variable defined in some scope.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    /// Slot in the local (or global) array.
    pub index: u16,
    pub constant: bool,
}

/// The outcome of resolving a name.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub symbol: Symbol,
    pub scope: Scope,
    /// Function levels between the reference and the definition; zero for
    /// locals and globals.
    pub depth: usize,
    /// Index into the referencing function's free-variable list.
    pub free_index: usize,
}

/// Symbols of a single function scope.
#[derive(Debug, Default)]
pub struct SymbolTable {
    by_name: AHashMap<String, Symbol>,
    free_by_name: AHashMap<String, Resolution>,
    symbols: Vec<Symbol>,
    free_vars: Vec<Resolution>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a variable, reusing the existing slot when redefined.
    pub fn define(&mut self, name: &str) -> Symbol {
        if let Some(existing) = self.by_name.get(name) {
            return existing.clone();
        }
        let symbol = Symbol {
            name: name.to_string(),
            index: self.symbols.len() as u16,
            constant: false,
        };
        self.by_name.insert(name.to_string(), symbol.clone());
        self.symbols.push(symbol.clone());
        symbol
    }

    pub fn define_constant(&mut self, name: &str) -> Symbol {
        let symbol = self.define(name);
        if let Some(entry) = self.by_name.get_mut(name) {
            entry.constant = true;
        }
        if let Some(entry) = self.symbols.iter_mut().find(|s| s.name == name) {
            entry.constant = true;
        }
        Symbol {
            constant: true,
            ..symbol
        }
    }

    /// Reserve an anonymous slot (destructuring parameter carriers).
    pub fn claim_slot(&mut self) -> u16 {
        let index = self.symbols.len() as u16;
        self.symbols.push(Symbol {
            name: "_".to_string(),
            index,
            constant: false,
        });
        index
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.by_name.get(name)
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn get_free(&self, name: &str) -> Option<&Resolution> {
        self.free_by_name.get(name)
    }

    /// Register a captured variable, deduplicating by name.
    pub fn add_free(&mut self, name: &str, mut resolution: Resolution) -> usize {
        if let Some(existing) = self.free_by_name.get(name) {
            return existing.free_index;
        }
        let index = self.free_vars.len();
        resolution.free_index = index;
        self.free_by_name.insert(name.to_string(), resolution.clone());
        self.free_vars.push(resolution);
        index
    }

    pub fn free_vars(&self) -> &[Resolution] {
        &self.free_vars
    }

    pub fn local_count(&self) -> usize {
        self.symbols.len()
    }

    pub fn local_names(&self) -> Vec<String> {
        self.symbols.iter().map(|s| s.name.clone()).collect()
    }
}

/// Stack of function scopes; the root scope holds globals.
#[derive(Debug)]
pub struct ScopeStack {
    scopes: Vec<SymbolTable>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self {
            scopes: vec![SymbolTable::new()],
        }
    }

    pub fn current(&self) -> &SymbolTable {
        self.scopes.last().unwrap()
    }

    pub fn current_mut(&mut self) -> &mut SymbolTable {
        self.scopes.last_mut().unwrap()
    }

    pub fn is_root(&self) -> bool {
        self.scopes.len() == 1
    }

    pub fn enter_function(&mut self) {
        self.scopes.push(SymbolTable::new());
    }

    pub fn exit_function(&mut self) -> SymbolTable {
        assert!(self.scopes.len() > 1, "cannot exit the root scope");
        self.scopes.pop().unwrap()
    }

    pub fn define(&mut self, name: &str) -> Symbol {
        self.current_mut().define(name)
    }

    pub fn define_constant(&mut self, name: &str) -> Symbol {
        self.current_mut().define_constant(name)
    }

    /// Every name visible from the current scope, for diagnostics.
    pub fn visible_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for scope in &self.scopes {
            for symbol in &scope.symbols {
                if symbol.name != "_" {
                    names.push(symbol.name.clone());
                }
            }
        }
        names
    }

    /// Resolve a name, marking it free in every scope it is carried
    /// through. Returns `None` for undefined names.
    pub fn resolve(&mut self, name: &str) -> Option<Resolution> {
        self.resolve_from(self.scopes.len() - 1, name)
    }

    fn resolve_from(&mut self, scope_index: usize, name: &str) -> Option<Resolution> {
        let is_root = scope_index == 0;

        if let Some(symbol) = self.scopes[scope_index].get(name) {
            let scope = if is_root { Scope::Global } else { Scope::Local };
            return Some(Resolution {
                symbol: symbol.clone(),
                scope,
                depth: 0,
                free_index: usize::MAX,
            });
        }

        if let Some(free) = self.scopes[scope_index].get_free(name) {
            return Some(free.clone());
        }

        if is_root {
            return None;
        }

        let parent = self.resolve_from(scope_index - 1, name)?;

        // Globals are reachable from any depth without capture.
        if parent.scope == Scope::Global {
            return Some(parent);
        }

        let depth = parent.depth + 1;
        let free_index = self.scopes[scope_index].add_free(
            name,
            Resolution {
                symbol: parent.symbol.clone(),
                scope: Scope::Free,
                depth,
                free_index: 0,
            },
        );

        Some(Resolution {
            symbol: parent.symbol,
            scope: Scope::Free,
            depth,
            free_index,
        })
    }
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}
