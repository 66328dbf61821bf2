// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The IDL-driven type system.
//!
//! A [`TypingContext`] owns the tables produced by loading IDL files:
//! named types, interfaces, the per-file namespace records, the
//! canonical [`TypeInstance`] cache and the constraint-validator
//! registry. Tables are populated during the (single-threaded) load
//! phase and only read while serving, so lookups go through lock-free
//! `DashMap` reads.
//!
//! A process-wide default context is available through
//! [`TypingContext::global`]; every API also works on an explicitly
//! constructed context so tests can spin up isolated instances.

mod idl;
mod instance;
mod typed;
mod validate;

pub use instance::TypeInstance;
pub use validate::{ValidationFailure, validation_error_object};

use crate::error::{Error, Result};
use crate::object::Object;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

/// Builtin type names reserved by the runtime.
pub const BUILTIN_TYPES: &[&str] = &[
    "nulltype",
    "bool",
    "uint64",
    "int64",
    "double",
    "date",
    "string",
    "binary",
    "fd",
    "dictionary",
    "array",
    "shmem",
    "error",
    "any",
];

/// Sentinel dictionary keys used by typed serialization.
pub const TYPE_KEY: &str = "%type";
pub const VALUE_KEY: &str = "%value";
pub const REALM_KEY: &str = "%realm";

/// Type class from the IDL header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    Struct,
    Union,
    Enum,
    Typedef,
    Builtin,
}

impl TypeClass {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Struct => "struct",
            Self::Union => "union",
            Self::Enum => "enum",
            Self::Typedef => "typedef",
            Self::Builtin => "builtin",
        }
    }
}

/// Struct member, union branch or enum tag.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub description: Option<String>,
    /// Type declaration, resolved lazily at use sites. `None` for enum
    /// tags.
    pub decl: Option<String>,
    /// Per-member constraints, keyed by constraint name.
    pub constraints: HashMap<String, Object>,
}

/// Record of one loaded IDL file: the namespace scope for lazy name
/// resolution and the raw body served by the typing download method.
#[derive(Debug)]
pub struct FileRecord {
    pub path: PathBuf,
    pub version: i64,
    pub namespace: Option<String>,
    pub description: Option<String>,
    /// Other namespaces in scope for fuzzy lookup.
    pub uses: Vec<String>,
    pub body: String,
}

/// A named type parsed from the IDL (or a builtin).
#[derive(Debug)]
pub struct Type {
    /// Fully qualified name (`namespace.localname`).
    pub name: String,
    pub namespace: Option<String>,
    pub description: Option<String>,
    pub class: TypeClass,
    /// Parent type declaration for single inheritance of members.
    pub parent: Option<String>,
    /// Generic variable names, in declaration order.
    pub generic_vars: Vec<String>,
    /// Members in declaration order.
    pub members: Vec<Member>,
    /// Type-level constraints.
    pub constraints: HashMap<String, Object>,
    /// Typedef target declaration.
    pub definition: Option<String>,
    /// Defining file, used for namespace lookups from this type.
    pub file: Option<Arc<FileRecord>>,
}

impl Type {
    fn builtin(name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: None,
            description: None,
            class: TypeClass::Builtin,
            parent: None,
            generic_vars: Vec::new(),
            members: Vec::new(),
            constraints: HashMap::new(),
            definition: None,
            file: None,
        }
    }

    pub fn is_generic(&self) -> bool {
        !self.generic_vars.is_empty()
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// Property access rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// One declared method argument.
#[derive(Debug, Clone)]
pub struct Argument {
    pub name: String,
    pub description: Option<String>,
    pub decl: String,
}

/// Interface member: method, property or event.
#[derive(Debug)]
pub enum IfMemberKind {
    Method {
        arguments: Vec<Argument>,
        result: Option<String>,
    },
    Property {
        decl: String,
        access: PropertyAccess,
        notify: bool,
    },
    Event {
        decl: Option<String>,
    },
}

#[derive(Debug)]
pub struct IfMember {
    pub name: String,
    pub description: Option<String>,
    pub kind: IfMemberKind,
}

/// A named interface parsed from the IDL.
#[derive(Debug)]
pub struct Interface {
    /// Fully qualified name.
    pub name: String,
    pub description: Option<String>,
    pub members: Vec<IfMember>,
    pub file: Option<Arc<FileRecord>>,
}

impl Interface {
    pub fn member(&self, name: &str) -> Option<&IfMember> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// Constraint validator: `(constraint value, object, errors) -> ok`.
pub type ConstraintFn =
    dyn Fn(&Object, &Object, &mut Vec<ValidationFailure>, &str) -> bool + Send + Sync;

/// The typing context: every table the IDL layer populates.
pub struct TypingContext {
    pub(crate) types: DashMap<String, Arc<Type>>,
    pub(crate) interfaces: DashMap<String, Arc<Interface>>,
    pub(crate) files: DashMap<PathBuf, Arc<FileRecord>>,
    /// Canonical form -> shared instance, for fully specialized
    /// instances only.
    pub(crate) cache: DashMap<String, Arc<TypeInstance>>,
    /// `(type name, constraint name)` -> validator.
    pub(crate) validators: DashMap<(String, String), Arc<ConstraintFn>>,
}

impl TypingContext {
    /// Fresh context with builtins and default constraint validators
    /// registered.
    pub fn new() -> Arc<Self> {
        let ctx = Self {
            types: DashMap::new(),
            interfaces: DashMap::new(),
            files: DashMap::new(),
            cache: DashMap::new(),
            validators: DashMap::new(),
        };
        for name in BUILTIN_TYPES {
            ctx.types
                .insert((*name).to_string(), Arc::new(Type::builtin(name)));
        }
        let ctx = Arc::new(ctx);
        validate::register_default_validators(&ctx);
        ctx
    }

    /// The process-wide default context.
    pub fn global() -> &'static Arc<TypingContext> {
        static GLOBAL: OnceLock<Arc<TypingContext>> = OnceLock::new();
        GLOBAL.get_or_init(TypingContext::new)
    }

    /// Look up a type by exact (fully qualified) name.
    pub fn find_type(&self, name: &str) -> Option<Arc<Type>> {
        self.types.get(name).map(|t| t.value().clone())
    }

    /// Look up an interface by exact name.
    pub fn find_interface(&self, name: &str) -> Option<Arc<Interface>> {
        self.interfaces.get(name).map(|i| i.value().clone())
    }

    /// Fuzzy type lookup: verbatim, then `<file namespace>.<name>`,
    /// then each `use` prefix. First hit wins.
    pub fn find_type_fuzzy(&self, name: &str, file: Option<&FileRecord>) -> Option<Arc<Type>> {
        if let Some(ty) = self.find_type(name) {
            return Some(ty);
        }
        let file = file?;
        if let Some(ns) = &file.namespace {
            if let Some(ty) = self.find_type(&format!("{}.{}", ns, name)) {
                return Some(ty);
            }
        }
        for prefix in &file.uses {
            if let Some(ty) = self.find_type(&format!("{}.{}", prefix, name)) {
                return Some(ty);
            }
        }
        None
    }

    /// Register (or replace) a constraint validator for
    /// `(type name, constraint name)`.
    pub fn register_validator(
        &self,
        type_name: impl Into<String>,
        constraint: impl Into<String>,
        validator: Arc<ConstraintFn>,
    ) {
        self.validators
            .insert((type_name.into(), constraint.into()), validator);
    }

    /// Members of `ty` including inherited ones: parent chain first,
    /// then own members overriding by name.
    pub fn members_of(&self, ty: &Arc<Type>) -> Result<Vec<(Member, Arc<Type>)>> {
        let mut chain: Vec<Arc<Type>> = Vec::new();
        let mut cursor = ty.clone();
        loop {
            chain.push(cursor.clone());
            let Some(parent_decl) = cursor.parent.clone() else {
                break;
            };
            let parent = self
                .instantiate_in(&parent_decl, cursor.file.as_deref(), None, None)?
                .realized_type()
                .ok_or_else(|| {
                    Error::Invalid(format!("unresolvable parent type '{}'", parent_decl))
                })?;
            if chain.len() > 32 {
                return Err(Error::Invalid(format!(
                    "inheritance cycle through '{}'",
                    ty.name
                )));
            }
            cursor = parent;
        }
        let mut merged: Vec<(Member, Arc<Type>)> = Vec::new();
        for owner in chain.iter().rev() {
            for member in &owner.members {
                if let Some(slot) = merged.iter_mut().find(|(m, _)| m.name == member.name) {
                    *slot = (member.clone(), owner.clone());
                } else {
                    merged.push((member.clone(), owner.clone()));
                }
            }
        }
        Ok(merged)
    }

    /// Bodies of every loaded IDL file, for the typing download
    /// service.
    pub fn file_bodies(&self) -> Vec<String> {
        self.files.iter().map(|f| f.body.clone()).collect()
    }

    /// Number of loaded IDL files.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}
