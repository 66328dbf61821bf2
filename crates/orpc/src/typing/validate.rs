// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Validation of objects against type instances.
//!
//! Failures carry a dot-path into the value (`.0.a` = member `a` of
//! argument 0) and are aggregated: one validation pass reports every
//! problem it can find, and the whole batch travels in the `extra`
//! field of a single EINVAL error object.

use crate::object::{ErrorObject, Kind, Object};
use crate::typing::instance::TypeInstance;
use crate::typing::{Interface, IfMemberKind, Type, TypeClass, TypingContext};
use std::sync::Arc;

/// One validation failure, located by dot-path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub path: String,
    pub message: String,
}

impl ValidationFailure {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Aggregate failures into the wire error: EINVAL, "Validation
/// failed", extra = array of `{path, message}` dictionaries.
pub fn validation_error_object(failures: Vec<ValidationFailure>) -> ErrorObject {
    let extra = Object::array();
    for failure in &failures {
        let entry = Object::dictionary();
        entry.dict_set("path", Object::from(failure.path.as_str()));
        entry.dict_set("message", Object::from(failure.message.as_str()));
        let _ = extra.append(entry);
    }
    ErrorObject::new(libc::EINVAL, "Validation failed").with_extra(extra)
}

impl TypingContext {
    /// Validate `obj` against `typei`. An empty result means the value
    /// is acceptable.
    pub fn validate(&self, typei: &Arc<TypeInstance>, obj: &Object) -> Vec<ValidationFailure> {
        let mut failures = Vec::new();
        self.validate_at(typei, obj, &mut failures, "");
        failures
    }

    fn validate_at(
        &self,
        typei: &Arc<TypeInstance>,
        obj: &Object,
        failures: &mut Vec<ValidationFailure>,
        path: &str,
    ) {
        let unwound = match self.unwind(typei) {
            Ok(unwound) => unwound,
            Err(e) => {
                failures.push(ValidationFailure::new(path, e.to_string()));
                return;
            }
        };
        let TypeInstance::Realized { ty, canonical, .. } = &*unwound else {
            failures.push(ValidationFailure::new(
                path,
                format!(
                    "unresolved generic variable '{}'",
                    unwound.canonical_form()
                ),
            ));
            return;
        };

        if ty.name == "any" {
            return;
        }

        // Annotated objects are checked structurally against the
        // declaration, then validated against their own (possibly
        // more specific) type; plain objects validate against the
        // declared one.
        let mut target = unwound.clone();
        if let Some(annotation) = obj.type_instance() {
            if !self.is_compatible(&unwound, &annotation) {
                failures.push(ValidationFailure::new(
                    path,
                    format!(
                        "Incompatible type {}, should be {}",
                        annotation.canonical_form(),
                        canonical
                    ),
                ));
                return;
            }
            match self.unwind(&annotation) {
                Ok(anno) => target = anno,
                Err(e) => {
                    failures.push(ValidationFailure::new(path, e.to_string()));
                    return;
                }
            }
        }
        let TypeInstance::Realized {
            ty,
            specializations,
            ..
        } = &*target
        else {
            return;
        };

        match ty.class {
            TypeClass::Builtin => validate_builtin(&ty.name, obj, failures, path),
            TypeClass::Struct => self.validate_struct(ty, specializations, obj, failures, path),
            TypeClass::Union => self.validate_union(ty, specializations, obj, failures, path),
            TypeClass::Enum => validate_enum(ty, obj, failures, path),
            // unwind() never returns a typedef.
            TypeClass::Typedef => {}
        }

        self.apply_constraints(&ty.name, &ty.constraints, obj, failures, path);
    }

    fn validate_struct(
        &self,
        ty: &Arc<Type>,
        specializations: &[Arc<TypeInstance>],
        obj: &Object,
        failures: &mut Vec<ValidationFailure>,
        path: &str,
    ) {
        if obj.kind() != Kind::Dictionary {
            failures.push(ValidationFailure::new(
                path,
                format!(
                    "Incompatible type {}, should be {}",
                    obj.kind().name(),
                    ty.name
                ),
            ));
            return;
        }
        let members = match self.members_of(ty) {
            Ok(members) => members,
            Err(e) => {
                failures.push(ValidationFailure::new(path, e.to_string()));
                return;
            }
        };
        for (member, owner) in &members {
            let child_path = format!("{}.{}", path, member.name);
            let Some(value) = obj.dict_get(&member.name) else {
                failures.push(ValidationFailure::new(
                    child_path,
                    format!("Member '{}' is missing", member.name),
                ));
                continue;
            };
            let Some(decl) = &member.decl else {
                continue;
            };
            match self.member_instance(decl, owner, ty, specializations) {
                Ok(member_ti) => {
                    self.validate_at(&member_ti, &value, failures, &child_path);
                    if !member.constraints.is_empty() {
                        let type_name = self
                            .unwind(&member_ti)
                            .ok()
                            .and_then(|u| u.realized_type())
                            .map(|t| t.name.clone())
                            .unwrap_or_default();
                        self.apply_constraints(
                            &type_name,
                            &member.constraints,
                            &value,
                            failures,
                            &child_path,
                        );
                    }
                }
                Err(e) => {
                    failures.push(ValidationFailure::new(child_path, e.to_string()));
                }
            }
        }
        obj.dict_apply(|key, _| {
            if !members.iter().any(|(m, _)| m.name == key) {
                failures.push(ValidationFailure::new(
                    format!("{}.{}", path, key),
                    format!("Extraneous member '{}'", key),
                ));
            }
            std::ops::ControlFlow::Continue(())
        });
    }

    fn validate_union(
        &self,
        ty: &Arc<Type>,
        specializations: &[Arc<TypeInstance>],
        obj: &Object,
        failures: &mut Vec<ValidationFailure>,
        path: &str,
    ) {
        for member in &ty.members {
            let Some(decl) = &member.decl else {
                continue;
            };
            let Ok(branch_ti) = self.member_instance(decl, ty, ty, specializations) else {
                continue;
            };
            let mut scratch = Vec::new();
            self.validate_at(&branch_ti, obj, &mut scratch, path);
            if scratch.is_empty() {
                return;
            }
        }
        failures.push(ValidationFailure::new(
            path,
            format!("No branch of union {} matches the value", ty.name),
        ));
    }

    /// Resolve a member declaration in its owner's scope, then bind
    /// the validated instance's specializations.
    pub(crate) fn member_instance(
        &self,
        decl: &str,
        owner: &Arc<Type>,
        instance_ty: &Arc<Type>,
        specializations: &[Arc<TypeInstance>],
    ) -> crate::error::Result<Arc<TypeInstance>> {
        let raw = self.instantiate_in(decl, owner.file.as_deref(), Some(owner), Some(owner))?;
        Ok(self.substitute(&raw, &instance_ty.generic_vars, specializations))
    }

    fn apply_constraints(
        &self,
        type_name: &str,
        constraints: &std::collections::HashMap<String, Object>,
        obj: &Object,
        failures: &mut Vec<ValidationFailure>,
        path: &str,
    ) {
        for (name, value) in constraints {
            match self.validators.get(&(type_name.to_string(), name.clone())) {
                Some(validator) => {
                    validator(value, obj, failures, path);
                }
                None => {
                    log::debug!(
                        "no validator for constraint '{}' on type '{}'",
                        name,
                        type_name
                    );
                }
            }
        }
    }

    /// Pre-call validation of method arguments against the declared
    /// signature. `Ok` when the interface does not declare the method.
    pub fn validate_method_args(
        &self,
        interface: &Interface,
        method: &str,
        args: &[Object],
    ) -> std::result::Result<(), ErrorObject> {
        let Some(member) = interface.member(method) else {
            return Ok(());
        };
        let IfMemberKind::Method { arguments, .. } = &member.kind else {
            return Ok(());
        };
        if args.len() != arguments.len() {
            return Err(validation_error_object(vec![ValidationFailure::new(
                "",
                format!(
                    "Expected {} argument(s), got {}",
                    arguments.len(),
                    args.len()
                ),
            )]));
        }
        let mut failures = Vec::new();
        for (i, (argument, obj)) in arguments.iter().zip(args).enumerate() {
            let path = format!(".{}", i);
            match self.instantiate_in(&argument.decl, interface.file.as_deref(), None, None) {
                Ok(ti) => self.validate_at(&ti, obj, &mut failures, &path),
                Err(e) => failures.push(ValidationFailure::new(path, e.to_string())),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(validation_error_object(failures))
        }
    }

    /// Post-call validation of a method result against the declared
    /// return type.
    pub fn validate_method_result(
        &self,
        interface: &Interface,
        method: &str,
        result: &Object,
    ) -> std::result::Result<(), ErrorObject> {
        let Some(member) = interface.member(method) else {
            return Ok(());
        };
        let IfMemberKind::Method {
            result: Some(decl), ..
        } = &member.kind
        else {
            return Ok(());
        };
        let mut failures = Vec::new();
        match self.instantiate_in(decl, interface.file.as_deref(), None, None) {
            Ok(ti) => self.validate_at(&ti, result, &mut failures, ""),
            Err(e) => failures.push(ValidationFailure::new("", e.to_string())),
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(validation_error_object(failures))
        }
    }
}

fn validate_builtin(name: &str, obj: &Object, failures: &mut Vec<ValidationFailure>, path: &str) {
    let actual = obj.kind().name();
    let ok = match name {
        "any" => true,
        "nulltype" => obj.is_null(),
        // Codecs canonicalize integer signedness, so either tag is
        // accepted when the value fits the declared range.
        "int64" => obj.as_integer().is_some(),
        "uint64" => obj.as_u64().is_some() || obj.as_i64().is_some_and(|v| v >= 0),
        other => actual == other,
    };
    if !ok {
        failures.push(ValidationFailure::new(
            path,
            format!("Incompatible type {}, should be {}", actual, name),
        ));
    }
}

fn validate_enum(ty: &Arc<Type>, obj: &Object, failures: &mut Vec<ValidationFailure>, path: &str) {
    let Some(tag) = obj.as_str() else {
        failures.push(ValidationFailure::new(
            path,
            format!(
                "Incompatible type {}, should be string (enum {})",
                obj.kind().name(),
                ty.name
            ),
        ));
        return;
    };
    if !ty.members.iter().any(|m| m.name == tag) {
        failures.push(ValidationFailure::new(
            path,
            format!("'{}' is not a valid value of enum {}", tag, ty.name),
        ));
    }
}

/// Integer and length constraints installed on every fresh context.
pub(crate) fn register_default_validators(ctx: &Arc<TypingContext>) {
    for type_name in ["int64", "uint64", "double"] {
        ctx.register_validator(
            type_name,
            "min",
            Arc::new(|limit, obj, failures, path| {
                let (Some(limit), Some(value)) = (number_of(limit), number_of(obj)) else {
                    return true;
                };
                if value < limit {
                    failures.push(ValidationFailure::new(
                        path,
                        format!("Value {} below minimum {}", value, limit),
                    ));
                    return false;
                }
                true
            }),
        );
        ctx.register_validator(
            type_name,
            "max",
            Arc::new(|limit, obj, failures, path| {
                let (Some(limit), Some(value)) = (number_of(limit), number_of(obj)) else {
                    return true;
                };
                if value > limit {
                    failures.push(ValidationFailure::new(
                        path,
                        format!("Value {} above maximum {}", value, limit),
                    ));
                    return false;
                }
                true
            }),
        );
    }
    for type_name in ["string", "binary", "array"] {
        ctx.register_validator(
            type_name,
            "min_length",
            Arc::new(|limit, obj, failures, path| {
                let (Some(limit), Some(len)) = (number_of(limit), length_of(obj)) else {
                    return true;
                };
                if (len as f64) < limit {
                    failures.push(ValidationFailure::new(
                        path,
                        format!("Length {} below minimum {}", len, limit),
                    ));
                    return false;
                }
                true
            }),
        );
        ctx.register_validator(
            type_name,
            "max_length",
            Arc::new(|limit, obj, failures, path| {
                let (Some(limit), Some(len)) = (number_of(limit), length_of(obj)) else {
                    return true;
                };
                if (len as f64) > limit {
                    failures.push(ValidationFailure::new(
                        path,
                        format!("Length {} above maximum {}", len, limit),
                    ));
                    return false;
                }
                true
            }),
        );
    }
}

fn number_of(obj: &Object) -> Option<f64> {
    obj.as_integer()
        .map(|v| v as f64)
        .or_else(|| obj.as_u64().map(|v| v as f64))
        .or_else(|| obj.as_f64())
}

fn length_of(obj: &Object) -> Option<usize> {
    match obj.kind() {
        Kind::String => obj.as_str().map(str::len),
        Kind::Binary => obj.as_bytes().map(<[u8]>::len),
        Kind::Array => Some(obj.len()),
        _ => None,
    }
}
