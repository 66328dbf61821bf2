// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Type instances: concrete, possibly specialized usages of a type.
//!
//! `Pair<int64, string>` is one instance of the generic type `Pair`.
//! Fully specialized instances are canonicalized: the context caches
//! one shared instance per canonical form, so repeated instantiation
//! returns pointer-equal values.

use crate::error::{Error, Result};
use crate::typing::{Type, TypeClass, TypingContext};
use std::sync::Arc;

/// Longest typedef chain (and deepest ancestor walk) accepted before
/// the resolver assumes a cycle.
const MAX_UNWIND_DEPTH: usize = 32;

/// A concrete usage of a type at some site.
#[derive(Debug)]
pub enum TypeInstance {
    /// Unresolved generic variable, bound by an enclosing declaration.
    Proxy { var: String },
    /// Realized instance of a named type.
    Realized {
        ty: Arc<Type>,
        /// Parallel to `ty.generic_vars`.
        specializations: Vec<Arc<TypeInstance>>,
        canonical: String,
    },
}

impl TypeInstance {
    /// Normalized string rendering, e.g. `Pair<int64,string>`.
    pub fn canonical_form(&self) -> &str {
        match self {
            Self::Proxy { var } => var,
            Self::Realized { canonical, .. } => canonical,
        }
    }

    /// The named type, for realized instances.
    pub fn realized_type(&self) -> Option<Arc<Type>> {
        match self {
            Self::Proxy { .. } => None,
            Self::Realized { ty, .. } => Some(ty.clone()),
        }
    }

    /// A proxy-free instance whose specializations are themselves
    /// fully specialized.
    pub fn is_fully_specialized(&self) -> bool {
        match self {
            Self::Proxy { .. } => false,
            Self::Realized {
                specializations, ..
            } => specializations.iter().all(|s| s.is_fully_specialized()),
        }
    }

    /// Specialization bound to the named generic variable.
    pub fn specialization_for(&self, var: &str) -> Option<Arc<TypeInstance>> {
        match self {
            Self::Proxy { .. } => None,
            Self::Realized {
                ty,
                specializations,
                ..
            } => {
                let idx = ty.generic_vars.iter().position(|v| v == var)?;
                specializations.get(idx).cloned()
            }
        }
    }
}

/// Split `Name<args>` into the name and raw argument declarations.
/// The argument list is nest-aware: `Map<string, Pair<a,b>>` yields
/// two arguments.
pub(crate) fn parse_decl(decl: &str) -> Result<(String, Vec<String>)> {
    let decl = decl.trim();
    let Some(open) = decl.find('<') else {
        if decl.is_empty() {
            return Err(Error::Invalid("empty type declaration".into()));
        }
        return Ok((decl.to_string(), Vec::new()));
    };
    if !decl.ends_with('>') {
        return Err(Error::Invalid(format!(
            "unbalanced type declaration '{}'",
            decl
        )));
    }
    let name = decl[..open].trim();
    if name.is_empty() {
        return Err(Error::Invalid(format!("missing type name in '{}'", decl)));
    }
    let inner = &decl[open + 1..decl.len() - 1];
    let args = split_top_level(inner)?;
    if args.is_empty() {
        return Err(Error::Invalid(format!(
            "empty type argument list in '{}'",
            decl
        )));
    }
    Ok((name.to_string(), args))
}

/// Split on top-level commas, honoring `<...>` nesting.
fn split_top_level(s: &str) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| Error::Invalid(format!("unbalanced '>' in '{}'", s)))?;
            }
            ',' if depth == 0 => {
                parts.push(s[start..i].trim().to_string());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(Error::Invalid(format!("unbalanced '<' in '{}'", s)));
    }
    let last = s[start..].trim();
    if !last.is_empty() {
        parts.push(last.to_string());
    }
    parts.retain(|p| !p.is_empty());
    Ok(parts)
}

fn render_canonical(name: &str, specs: &[Arc<TypeInstance>]) -> String {
    if specs.is_empty() {
        return name.to_string();
    }
    let args: Vec<&str> = specs.iter().map(|s| s.canonical_form()).collect();
    format!("{}<{}>", name, args.join(","))
}

impl TypingContext {
    /// Instantiate a declaration with no surrounding scope.
    pub fn instantiate(&self, decl: &str) -> Result<Arc<TypeInstance>> {
        self.instantiate_in(decl, None, None, None)
    }

    /// Instantiate a declaration.
    ///
    /// `file` scopes fuzzy lookups; `parent` makes the generic
    /// variables of a declaring type's ancestor chain visible;
    /// `ptype` makes the declaring type's own variables visible.
    /// Names that resolve to a visible generic variable become
    /// proxies; anything else unknown is EINVAL.
    pub fn instantiate_in(
        &self,
        decl: &str,
        file: Option<&crate::typing::FileRecord>,
        parent: Option<&Arc<Type>>,
        ptype: Option<&Arc<Type>>,
    ) -> Result<Arc<TypeInstance>> {
        let (name, args) = parse_decl(decl)?;

        let Some(ty) = self.find_type_fuzzy(&name, file) else {
            if let Some(parent) = parent {
                if self.ancestor_has_var(parent, &name) {
                    return Ok(Arc::new(TypeInstance::Proxy { var: name }));
                }
            }
            if let Some(ptype) = ptype {
                if ptype.generic_vars.iter().any(|v| v == &name) {
                    return Ok(Arc::new(TypeInstance::Proxy { var: name }));
                }
            }
            return Err(Error::Invalid(format!("unknown type '{}'", name)));
        };

        if args.len() != ty.generic_vars.len() {
            return Err(Error::Invalid(format!(
                "type '{}' expects {} type argument(s), got {}",
                ty.name,
                ty.generic_vars.len(),
                args.len()
            )));
        }

        if args.is_empty() {
            return Ok(self.canonical_instance(&ty, Vec::new()));
        }

        let specializations = args
            .iter()
            .map(|arg| self.instantiate_in(arg, file, parent, ptype))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.canonical_instance(&ty, specializations))
    }

    /// Build an instance, sharing through the canonical cache when it
    /// is fully specialized.
    fn canonical_instance(
        &self,
        ty: &Arc<Type>,
        specializations: Vec<Arc<TypeInstance>>,
    ) -> Arc<TypeInstance> {
        let canonical = render_canonical(&ty.name, &specializations);
        let cacheable = specializations.iter().all(|s| s.is_fully_specialized());
        if cacheable {
            if let Some(hit) = self.cache.get(&canonical) {
                return hit.clone();
            }
        }
        let inst = Arc::new(TypeInstance::Realized {
            ty: ty.clone(),
            specializations,
            canonical: canonical.clone(),
        });
        if cacheable {
            self.cache.insert(canonical, inst.clone());
        }
        inst
    }

    /// Does `ty` or any of its ancestors declare a generic variable
    /// with this name?
    fn ancestor_has_var(&self, ty: &Arc<Type>, var: &str) -> bool {
        let mut cursor = ty.clone();
        for _ in 0..MAX_UNWIND_DEPTH {
            if cursor.generic_vars.iter().any(|v| v == var) {
                return true;
            }
            let Some(parent_decl) = &cursor.parent else {
                return false;
            };
            let Ok((name, _)) = parse_decl(parent_decl) else {
                return false;
            };
            match self.find_type_fuzzy(&name, cursor.file.as_deref()) {
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
        false
    }

    /// Replace proxies bound to `vars` with the given specializations.
    pub(crate) fn substitute(
        &self,
        inst: &Arc<TypeInstance>,
        vars: &[String],
        specs: &[Arc<TypeInstance>],
    ) -> Arc<TypeInstance> {
        match &**inst {
            TypeInstance::Proxy { var } => vars
                .iter()
                .position(|v| v == var)
                .and_then(|i| specs.get(i).cloned())
                .unwrap_or_else(|| inst.clone()),
            TypeInstance::Realized {
                ty,
                specializations,
                ..
            } => {
                if specializations.is_empty() {
                    return inst.clone();
                }
                let substituted: Vec<_> = specializations
                    .iter()
                    .map(|s| self.substitute(s, vars, specs))
                    .collect();
                self.canonical_instance(ty, substituted)
            }
        }
    }

    /// Follow typedef definitions until a non-typedef instance is
    /// reached. EINVAL on chains that fail to terminate.
    pub fn unwind(&self, inst: &Arc<TypeInstance>) -> Result<Arc<TypeInstance>> {
        let mut cursor = inst.clone();
        for _ in 0..MAX_UNWIND_DEPTH {
            let next = match &*cursor {
                TypeInstance::Realized {
                    ty,
                    specializations,
                    ..
                } if ty.class == TypeClass::Typedef => {
                    let definition = ty.definition.as_ref().ok_or_else(|| {
                        Error::Invalid(format!("typedef '{}' has no definition", ty.name))
                    })?;
                    let def =
                        self.instantiate_in(definition, ty.file.as_deref(), None, Some(ty))?;
                    self.substitute(&def, &ty.generic_vars, specializations)
                }
                _ => return Ok(cursor),
            };
            cursor = next;
        }
        Err(Error::Invalid(format!(
            "typedef chain through '{}' does not terminate",
            inst.canonical_form()
        )))
    }

    /// Structural compatibility of an actual instance against a
    /// declared one.
    ///
    /// Specialization arguments are not checked recursively; a
    /// `List<int64>` passes where `List<string>` is declared. Member
    /// validation still inspects the values themselves.
    pub fn is_compatible(&self, decl: &Arc<TypeInstance>, actual: &Arc<TypeInstance>) -> bool {
        let (decl_ty, decl_specs) = match &**decl {
            TypeInstance::Proxy { .. } => return true,
            TypeInstance::Realized {
                ty,
                specializations,
                ..
            } => (ty, specializations),
        };
        if decl_ty.name == "any" {
            return true;
        }
        let (actual_ty, actual_specs) = match &**actual {
            TypeInstance::Proxy { .. } => return false,
            TypeInstance::Realized {
                ty,
                specializations,
                ..
            } => (ty, specializations),
        };
        if decl_specs.len() > actual_specs.len() {
            return false;
        }
        if decl_ty.name == actual_ty.name {
            return true;
        }
        // The declared type may be an ancestor of the actual one.
        let mut cursor = actual_ty.clone();
        for _ in 0..MAX_UNWIND_DEPTH {
            let Some(parent_decl) = &cursor.parent else {
                return false;
            };
            let Ok((name, _)) = parse_decl(parent_decl) else {
                return false;
            };
            let Some(parent) = self.find_type_fuzzy(&name, cursor.file.as_deref()) else {
                return false;
            };
            if parent.name == decl_ty.name {
                return true;
            }
            cursor = parent;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_and_generic() {
        assert_eq!(parse_decl("int64").unwrap(), ("int64".into(), vec![]));
        let (name, args) = parse_decl("Map<string, Pair<int64,double>>").unwrap();
        assert_eq!(name, "Map");
        assert_eq!(args, vec!["string".to_string(), "Pair<int64,double>".into()]);
    }

    #[test]
    fn parse_rejects_unbalanced() {
        assert!(parse_decl("Map<string").is_err());
        assert!(parse_decl("Map<>").is_err());
        assert!(parse_decl("").is_err());
    }

    #[test]
    fn builtin_instances_are_cached() {
        let ctx = TypingContext::new();
        let a = ctx.instantiate("int64").unwrap();
        let b = ctx.instantiate("int64").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.canonical_form(), "int64");
        assert!(a.is_fully_specialized());
    }

    #[test]
    fn unknown_type_is_einval() {
        let ctx = TypingContext::new();
        let err = ctx.instantiate("Mystery").unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);
    }

    #[test]
    fn arity_mismatch_is_einval() {
        let ctx = TypingContext::new();
        // Builtins are non-generic.
        let err = ctx.instantiate("int64<string>").unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);
    }

    #[test]
    fn any_is_always_compatible() {
        let ctx = TypingContext::new();
        let a = ctx.instantiate("any").unwrap();
        let b = ctx.instantiate("string").unwrap();
        assert!(ctx.is_compatible(&a, &b));
        assert!(!ctx.is_compatible(&b, &a));
    }
}
