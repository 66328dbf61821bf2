// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! IDL file loading.
//!
//! An IDL file is a YAML document. The `meta` key is mandatory and
//! carries `{version, namespace?, description?, use?}`; every other
//! top-level key declares a type or an interface:
//!
//! ```yaml
//! meta:
//!   version: 1
//!   namespace: com.example
//!
//! struct Pair<A, B>:
//!   members:
//!     a: A
//!     b: B
//!
//! typedef IntPair: Pair<int64, int64>
//!
//! interface Calculator:
//!   method add:
//!     arguments:
//!       - name: a
//!         type: int64
//!       - name: b
//!         type: int64
//!     return: int64
//! ```
//!
//! Loading is idempotent per path and single-threaded by convention:
//! the tables are read-only once serving starts.

use crate::error::{Error, Result};
use crate::object::{Kind, Object};
use crate::serializer::{Serializer, YamlSerializer};
use crate::typing::{
    Argument, FileRecord, IfMember, IfMemberKind, Interface, Member, PropertyAccess, Type,
    TypeClass, TypingContext,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

impl TypingContext {
    /// Load one IDL file. Loading the same path twice is a no-op.
    pub fn load_file(&self, path: &Path) -> Result<()> {
        let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if self.files.contains_key(&key) {
            return Ok(());
        }
        let text = std::fs::read_to_string(path)?;
        self.load_source(key, &text)
    }

    /// Load IDL from a string under a virtual path (tests, downloads).
    pub fn load_str(&self, key: impl Into<PathBuf>, text: &str) -> Result<()> {
        self.load_source(key.into(), text)
    }

    /// Load every `*.yaml` / `*.yml` file in a directory, in name
    /// order.
    pub fn load_types_dir(&self, dir: &Path) -> Result<()> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml" | "yml")
                )
            })
            .collect();
        paths.sort();
        for path in paths {
            self.load_file(&path)?;
        }
        Ok(())
    }

    fn load_source(&self, path: PathBuf, text: &str) -> Result<()> {
        if self.files.contains_key(&path) {
            return Ok(());
        }
        let doc = YamlSerializer.deserialize(text.as_bytes())?;
        if doc.kind() != Kind::Dictionary {
            return Err(Error::Invalid(format!(
                "{}: IDL document is not a dictionary",
                path.display()
            )));
        }
        let meta = doc.dict_get("meta").ok_or_else(|| {
            Error::Invalid(format!("{}: missing meta section", path.display()))
        })?;
        let version = meta
            .dict_get("version")
            .and_then(|v| v.as_integer())
            .ok_or_else(|| {
                Error::Invalid(format!("{}: meta.version is missing", path.display()))
            })?;
        let namespace = meta
            .dict_get("namespace")
            .and_then(|v| v.as_str().map(str::to_string));
        let description = meta
            .dict_get("description")
            .and_then(|v| v.as_str().map(str::to_string));
        let mut uses = Vec::new();
        if let Some(list) = meta.dict_get("use") {
            for i in 0..list.len() {
                if let Some(item) = list.get(i) {
                    if let Some(ns) = item.as_str() {
                        uses.push(ns.to_string());
                    }
                }
            }
        }

        let file = Arc::new(FileRecord {
            path: path.clone(),
            version,
            namespace,
            description,
            uses,
            body: text.to_string(),
        });
        self.files.insert(path.clone(), file.clone());

        for key in doc.dict_keys() {
            if key == "meta" {
                continue;
            }
            let value = doc.dict_get(&key).unwrap_or_else(Object::null);
            self.load_entry(&file, &key, &value).map_err(|e| {
                Error::Invalid(format!("{}: {}: {}", path.display(), key, e))
            })?;
        }
        Ok(())
    }

    fn load_entry(&self, file: &Arc<FileRecord>, header: &str, value: &Object) -> Result<()> {
        let (keyword, rest) = header
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::Invalid("expected '<class> <name>' header".into()))?;
        let rest = rest.trim();
        match keyword {
            "struct" => self.load_type(file, TypeClass::Struct, rest, value),
            "union" => self.load_type(file, TypeClass::Union, rest, value),
            "enum" => self.load_type(file, TypeClass::Enum, rest, value),
            "typedef" => self.load_type(file, TypeClass::Typedef, rest, value),
            "interface" => self.load_interface(file, rest, value),
            other => Err(Error::Invalid(format!(
                "unknown declaration class '{}'",
                other
            ))),
        }
    }

    fn qualify(file: &FileRecord, name: &str) -> String {
        if name.contains('.') {
            return name.to_string();
        }
        match &file.namespace {
            Some(ns) => format!("{}.{}", ns, name),
            None => name.to_string(),
        }
    }

    fn load_type(
        &self,
        file: &Arc<FileRecord>,
        class: TypeClass,
        decl: &str,
        value: &Object,
    ) -> Result<()> {
        let (local_name, generic_vars) = crate::typing::instance::parse_decl(decl)?;
        for var in &generic_vars {
            if var.contains('<') {
                return Err(Error::Invalid(format!(
                    "generic variable '{}' must be a plain identifier",
                    var
                )));
            }
        }
        if crate::typing::BUILTIN_TYPES.contains(&local_name.as_str()) {
            return Err(Error::Invalid(format!(
                "'{}' is a reserved builtin type name",
                local_name
            )));
        }
        let name = Self::qualify(file, &local_name);
        if self.types.contains_key(&name) {
            return Err(Error::Invalid(format!("duplicate type '{}'", name)));
        }

        let description = value
            .dict_get("description")
            .and_then(|v| v.as_str().map(str::to_string));
        let parent = value
            .dict_get("inherits")
            .and_then(|v| v.as_str().map(str::to_string));
        let constraints = constraints_of(value.dict_get("constraints"));

        let (members, definition) = match class {
            TypeClass::Enum => (enum_members(value)?, None),
            TypeClass::Typedef => (Vec::new(), Some(typedef_definition(value)?)),
            TypeClass::Struct | TypeClass::Union => (struct_members(value)?, None),
            TypeClass::Builtin => (Vec::new(), None),
        };

        self.types.insert(
            name.clone(),
            Arc::new(Type {
                name,
                namespace: file.namespace.clone(),
                description,
                class,
                parent,
                generic_vars,
                members,
                constraints,
                definition,
                file: Some(file.clone()),
            }),
        );
        Ok(())
    }

    fn load_interface(&self, file: &Arc<FileRecord>, name: &str, value: &Object) -> Result<()> {
        if name.is_empty() || name.contains('<') {
            return Err(Error::Invalid(format!("bad interface name '{}'", name)));
        }
        let fq_name = Self::qualify(file, name);
        if self.interfaces.contains_key(&fq_name) {
            return Err(Error::Invalid(format!("duplicate interface '{}'", fq_name)));
        }
        let description = value
            .dict_get("description")
            .and_then(|v| v.as_str().map(str::to_string));
        let mut members = Vec::new();
        for key in value.dict_keys() {
            if key == "description" {
                continue;
            }
            let entry = value.dict_get(&key).unwrap_or_else(Object::null);
            let (keyword, member_name) = key.split_once(char::is_whitespace).ok_or_else(|| {
                Error::Invalid(format!("bad interface member header '{}'", key))
            })?;
            let member_name = member_name.trim().to_string();
            let member_description = entry
                .dict_get("description")
                .and_then(|v| v.as_str().map(str::to_string));
            let kind = match keyword {
                "method" => method_member(&entry)?,
                "property" => property_member(&entry)?,
                "event" => IfMemberKind::Event {
                    decl: entry
                        .dict_get("type")
                        .and_then(|v| v.as_str().map(str::to_string)),
                },
                other => {
                    return Err(Error::Invalid(format!(
                        "unknown interface member class '{}'",
                        other
                    )))
                }
            };
            members.push(IfMember {
                name: member_name,
                description: member_description,
                kind,
            });
        }
        self.interfaces.insert(
            fq_name.clone(),
            Arc::new(Interface {
                name: fq_name,
                description,
                members,
                file: Some(file.clone()),
            }),
        );
        Ok(())
    }
}

fn constraints_of(value: Option<Object>) -> HashMap<String, Object> {
    let mut constraints = HashMap::new();
    if let Some(dict) = value {
        dict.dict_apply(|name, v| {
            constraints.insert(name.to_string(), v.clone());
            std::ops::ControlFlow::Continue(())
        });
    }
    constraints
}

fn struct_members(value: &Object) -> Result<Vec<Member>> {
    let Some(members) = value.dict_get("members") else {
        return Ok(Vec::new());
    };
    if members.kind() != Kind::Dictionary {
        return Err(Error::Invalid("members must be a dictionary".into()));
    }
    let mut out = Vec::new();
    for name in members.dict_keys() {
        let entry = members.dict_get(&name).unwrap_or_else(Object::null);
        let member = match entry.kind() {
            // Shorthand: `a: int64`
            Kind::String => Member {
                name: name.clone(),
                description: None,
                decl: entry.as_str().map(str::to_string),
                constraints: HashMap::new(),
            },
            Kind::Dictionary => {
                let decl = entry
                    .dict_get("type")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or_else(|| {
                        Error::Invalid(format!("member '{}' has no type", name))
                    })?;
                Member {
                    name: name.clone(),
                    description: entry
                        .dict_get("description")
                        .and_then(|v| v.as_str().map(str::to_string)),
                    decl: Some(decl),
                    constraints: constraints_of(entry.dict_get("constraints")),
                }
            }
            other => {
                return Err(Error::Invalid(format!(
                    "member '{}' declared as {}",
                    name,
                    other.name()
                )))
            }
        };
        out.push(member);
    }
    Ok(out)
}

fn enum_members(value: &Object) -> Result<Vec<Member>> {
    let Some(values) = value.dict_get("values") else {
        return Err(Error::Invalid("enum has no values list".into()));
    };
    if values.kind() != Kind::Array {
        return Err(Error::Invalid("enum values must be a list".into()));
    }
    let mut out = Vec::new();
    for i in 0..values.len() {
        let tag = values
            .get(i)
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| Error::Invalid("enum tags must be strings".into()))?;
        out.push(Member {
            name: tag,
            description: None,
            decl: None,
            constraints: HashMap::new(),
        });
    }
    Ok(out)
}

fn typedef_definition(value: &Object) -> Result<String> {
    match value.kind() {
        // Shorthand: `typedef IntPair: Pair<int64, int64>`
        Kind::String => Ok(value.as_str().unwrap_or_default().to_string()),
        Kind::Dictionary => value
            .dict_get("type")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| Error::Invalid("typedef has no type".into())),
        other => Err(Error::Invalid(format!(
            "typedef declared as {}",
            other.name()
        ))),
    }
}

fn method_member(entry: &Object) -> Result<IfMemberKind> {
    let mut arguments = Vec::new();
    if let Some(list) = entry.dict_get("arguments") {
        if list.kind() != Kind::Array {
            return Err(Error::Invalid("arguments must be a list".into()));
        }
        for i in 0..list.len() {
            let arg = list.get(i).unwrap_or_else(Object::null);
            let name = arg
                .dict_get("name")
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| Error::Invalid(format!("argument {} has no name", i)))?;
            let decl = arg
                .dict_get("type")
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| Error::Invalid(format!("argument '{}' has no type", name)))?;
            arguments.push(Argument {
                name,
                description: arg
                    .dict_get("description")
                    .and_then(|v| v.as_str().map(str::to_string)),
                decl,
            });
        }
    }
    let result = entry
        .dict_get("return")
        .and_then(|v| v.as_str().map(str::to_string));
    Ok(IfMemberKind::Method { arguments, result })
}

fn property_member(entry: &Object) -> Result<IfMemberKind> {
    let decl = entry
        .dict_get("type")
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| Error::Invalid("property has no type".into()))?;
    let access = match entry
        .dict_get("access")
        .and_then(|v| v.as_str().map(str::to_string))
        .as_deref()
    {
        None | Some("read-write") => PropertyAccess::ReadWrite,
        Some("read-only") => PropertyAccess::ReadOnly,
        Some("write-only") => PropertyAccess::WriteOnly,
        Some(other) => {
            return Err(Error::Invalid(format!("unknown access '{}'", other)));
        }
    };
    let notify = entry
        .dict_get("notify")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    Ok(IfMemberKind::Property {
        decl,
        access,
        notify,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAIR_IDL: &str = r#"
meta:
  version: 1
  namespace: com.example

struct Pair<A, B>:
  description: a generic pair
  members:
    a: A
    b: B

typedef IntPair: Pair<int64, int64>

struct List<T>:
  members:
    items: array

enum Color:
  values: [red, green, blue]

union Number:
  members:
    int_value: int64
    float_value: double

interface Calculator:
  description: arithmetic over int64
  method add:
    arguments:
      - name: a
        type: int64
      - name: b
        type: int64
    return: int64
  property precision:
    type: int64
    access: read-only
    notify: true
  event overflow:
    type: int64
"#;

    fn loaded() -> Arc<TypingContext> {
        let ctx = TypingContext::new();
        ctx.load_str("pair.yaml", PAIR_IDL).unwrap();
        ctx
    }

    #[test]
    fn loads_types_and_interfaces() {
        let ctx = loaded();
        assert!(ctx.find_type("com.example.Pair").is_some());
        assert!(ctx.find_type("com.example.IntPair").is_some());
        assert!(ctx.find_interface("com.example.Calculator").is_some());
        assert_eq!(ctx.file_count(), 1);
    }

    #[test]
    fn loading_same_path_is_idempotent() {
        let ctx = loaded();
        // Duplicate definitions would error; the same path must not.
        ctx.load_str("pair.yaml", PAIR_IDL).unwrap();
        assert_eq!(ctx.file_count(), 1);
    }

    #[test]
    fn missing_meta_is_einval() {
        let ctx = TypingContext::new();
        let err = ctx.load_str("bad.yaml", "struct X:\n  members: {}\n").unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);
    }

    #[test]
    fn namespace_scopes_fuzzy_lookup() {
        let ctx = loaded();
        let file = ctx.files.get(&PathBuf::from("pair.yaml")).unwrap().clone();
        assert!(ctx.find_type_fuzzy("Pair", Some(&file)).is_some());
        assert!(ctx.find_type_fuzzy("Pair", None).is_none());
    }

    #[test]
    fn generic_instantiation_and_cache() {
        let ctx = loaded();
        let a = ctx.instantiate("com.example.Pair<int64, string>").unwrap();
        assert_eq!(a.canonical_form(), "com.example.Pair<int64,string>");
        let b = ctx.instantiate("com.example.Pair<int64,string>").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_fully_specialized());
    }

    #[test]
    fn generic_arity_checked() {
        let ctx = loaded();
        let err = ctx.instantiate("com.example.Pair<int64>").unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);
    }

    #[test]
    fn nested_generics_to_depth_8() {
        let ctx = loaded();
        let mut decl = String::from("int64");
        for _ in 0..8 {
            decl = format!("com.example.Pair<{}, string>", decl);
        }
        let ti = ctx.instantiate(&decl).unwrap();
        assert!(ti.is_fully_specialized());
        let again = ctx.instantiate(&decl).unwrap();
        assert!(Arc::ptr_eq(&ti, &again));
    }

    #[test]
    fn typedef_unwinds_to_definition() {
        let ctx = loaded();
        let ti = ctx.instantiate("com.example.IntPair").unwrap();
        let unwound = ctx.unwind(&ti).unwrap();
        assert_eq!(unwound.canonical_form(), "com.example.Pair<int64,int64>");
    }

    #[test]
    fn validate_int_pair() {
        let ctx = loaded();
        let ti = ctx.instantiate("com.example.IntPair").unwrap();

        let good = Object::dictionary();
        good.dict_set("a", Object::int64(1));
        good.dict_set("b", Object::int64(2));
        assert!(ctx.validate(&ti, &good).is_empty());

        let bad = Object::dictionary();
        bad.dict_set("a", Object::from("x"));
        bad.dict_set("b", Object::int64(2));
        let failures = ctx.validate(&ti, &bad);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].path, ".a");
        assert_eq!(
            failures[0].message,
            "Incompatible type string, should be int64"
        );
    }

    #[test]
    fn validate_missing_and_extraneous_members() {
        let ctx = loaded();
        let ti = ctx.instantiate("com.example.IntPair").unwrap();
        let obj = Object::dictionary();
        obj.dict_set("a", Object::int64(1));
        obj.dict_set("c", Object::int64(3));
        let failures = ctx.validate(&ti, &obj);
        assert!(failures.iter().any(|f| f.path == ".b"));
        assert!(failures.iter().any(|f| f.path == ".c"));
    }

    #[test]
    fn validate_enum_tags() {
        let ctx = loaded();
        let ti = ctx.instantiate("com.example.Color").unwrap();
        assert!(ctx.validate(&ti, &Object::from("green")).is_empty());
        let failures = ctx.validate(&ti, &Object::from("purple"));
        assert_eq!(failures.len(), 1);
        assert!(failures[0].message.contains("purple"));
    }

    #[test]
    fn validate_union_branches() {
        let ctx = loaded();
        let ti = ctx.instantiate("com.example.Number").unwrap();
        assert!(ctx.validate(&ti, &Object::int64(3)).is_empty());
        assert!(ctx.validate(&ti, &Object::double(0.5)).is_empty());
        assert!(!ctx.validate(&ti, &Object::from("nope")).is_empty());
    }

    #[test]
    fn compatibility_does_not_recurse_into_specializations() {
        let ctx = loaded();
        let declared = ctx.instantiate("com.example.List<string>").unwrap();
        let actual = ctx.instantiate("com.example.List<int64>").unwrap();
        assert!(ctx.is_compatible(&declared, &actual));
    }

    #[test]
    fn load_types_dir_reads_yaml_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.yaml"),
            "meta:\n  version: 1\n  namespace: com.a\n\nstruct One:\n  members:\n    v: int64\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let ctx = TypingContext::new();
        ctx.load_types_dir(dir.path()).unwrap();
        assert!(ctx.find_type("com.a.One").is_some());
        assert_eq!(ctx.file_count(), 1);
    }

    #[test]
    fn reserved_builtin_name_rejected() {
        let ctx = TypingContext::new();
        let err = ctx
            .load_str(
                "bad.yaml",
                "meta:\n  version: 1\n\nstruct string:\n  members: {}\n",
            )
            .unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);
    }
}
