// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed serialization: the bridge between annotated objects and the
//! self-describing wire form.
//!
//! Serialization renders a type annotation into sentinel dictionary
//! keys (`%type`, `%value`, `%realm`); deserialization strips them
//! back out and re-attaches the annotation. Plain objects pass
//! through structurally unchanged, so an uninitialized typing layer
//! degrades to the identity transform.

use crate::error::{Error, Result};
use crate::object::{Kind, Object};
use crate::typing::instance::TypeInstance;
use crate::typing::{TypeClass, TypingContext, REALM_KEY, TYPE_KEY, VALUE_KEY};
use std::ops::ControlFlow;
use std::sync::Arc;

impl TypingContext {
    /// Attach the type named by `decl` to `obj`.
    pub fn annotate(&self, obj: &Object, decl: &str) -> Result<()> {
        let ti = self.instantiate(decl)?;
        obj.set_type_instance(Some(ti));
        Ok(())
    }

    /// Render annotations into sentinel keys, descending containers.
    pub fn serialize(&self, obj: &Object) -> Result<Object> {
        let Some(annotation) = obj.type_instance() else {
            return self.serialize_plain(obj);
        };
        let unwound = self.unwind(&annotation)?;
        let Some(ty) = unwound.realized_type() else {
            return Err(Error::Invalid(format!(
                "cannot serialize unresolved generic '{}'",
                annotation.canonical_form()
            )));
        };
        // The pre-unwind form is rendered so typedef names survive the
        // round trip.
        let canonical = annotation.canonical_form().to_string();
        let out = Object::dictionary();
        out.dict_set(TYPE_KEY, Object::from(canonical));
        match ty.class {
            TypeClass::Struct | TypeClass::Union if obj.kind() == Kind::Dictionary => {
                let mut failed = None;
                obj.dict_apply(|key, value| match self.serialize(value) {
                    Ok(v) => {
                        out.dict_set(key, v);
                        ControlFlow::Continue(())
                    }
                    Err(e) => {
                        failed = Some(e);
                        ControlFlow::Break(())
                    }
                });
                if let Some(e) = failed {
                    return Err(e);
                }
            }
            _ => {
                out.dict_set(VALUE_KEY, self.serialize_plain(obj)?);
            }
        }
        Ok(out)
    }

    fn serialize_plain(&self, obj: &Object) -> Result<Object> {
        match obj.kind() {
            Kind::Array => {
                let out = Object::array();
                let mut failed = None;
                obj.apply(|_, item| match self.serialize(item) {
                    Ok(v) => {
                        let _ = out.append(v);
                        ControlFlow::Continue(())
                    }
                    Err(e) => {
                        failed = Some(e);
                        ControlFlow::Break(())
                    }
                });
                if let Some(e) = failed {
                    return Err(e);
                }
                Ok(out)
            }
            Kind::Dictionary => {
                let out = Object::dictionary();
                let mut failed = None;
                obj.dict_apply(|key, value| match self.serialize(value) {
                    Ok(v) => {
                        out.dict_set(key, v);
                        ControlFlow::Continue(())
                    }
                    Err(e) => {
                        failed = Some(e);
                        ControlFlow::Break(())
                    }
                });
                if let Some(e) = failed {
                    return Err(e);
                }
                Ok(out)
            }
            _ => Ok(obj.clone()),
        }
    }

    /// Strip sentinel keys and re-attach annotations.
    pub fn deserialize(&self, obj: &Object) -> Result<Object> {
        match obj.kind() {
            Kind::Array => {
                let out = Object::array();
                let mut failed = None;
                obj.apply(|_, item| match self.deserialize(item) {
                    Ok(v) => {
                        let _ = out.append(v);
                        ControlFlow::Continue(())
                    }
                    Err(e) => {
                        failed = Some(e);
                        ControlFlow::Break(())
                    }
                });
                if let Some(e) = failed {
                    return Err(e);
                }
                Ok(out)
            }
            Kind::Dictionary => self.deserialize_dict(obj),
            _ => Ok(obj.clone()),
        }
    }

    fn deserialize_dict(&self, obj: &Object) -> Result<Object> {
        let realm = obj
            .dict_get(REALM_KEY)
            .and_then(|r| r.as_str().map(str::to_string));
        let Some(type_name) = obj
            .dict_get(TYPE_KEY)
            .and_then(|t| t.as_str().map(str::to_string))
        else {
            // Plain dictionary: rebuild, stripping a stray realm key.
            let out = Object::dictionary();
            let mut failed = None;
            obj.dict_apply(|key, value| {
                if key == REALM_KEY {
                    return ControlFlow::Continue(());
                }
                match self.deserialize(value) {
                    Ok(v) => {
                        out.dict_set(key, v);
                        ControlFlow::Continue(())
                    }
                    Err(e) => {
                        failed = Some(e);
                        ControlFlow::Break(())
                    }
                }
            });
            if let Some(e) = failed {
                return Err(e);
            }
            return Ok(out);
        };

        let ti = self.instantiate_realmed(&type_name, realm.as_deref())?;

        if let Some(value) = obj.dict_get(VALUE_KEY) {
            let inner = self.deserialize(&value)?;
            let inner = self.retag_integer(&ti, inner)?;
            inner.set_type_instance(Some(ti));
            return Ok(inner);
        }

        let out = Object::dictionary();
        let mut failed = None;
        obj.dict_apply(|key, value| {
            if key == TYPE_KEY || key == REALM_KEY {
                return ControlFlow::Continue(());
            }
            match self.deserialize(value) {
                Ok(v) => {
                    out.dict_set(key, v);
                    ControlFlow::Continue(())
                }
                Err(e) => {
                    failed = Some(e);
                    ControlFlow::Break(())
                }
            }
        });
        if let Some(e) = failed {
            return Err(e);
        }
        self.retag_members(&ti, &out);
        out.set_type_instance(Some(ti));
        Ok(out)
    }

    /// Walk the declared members of a struct instance and win back the
    /// integer tags the codec canonicalized away.
    fn retag_members(&self, ti: &Arc<TypeInstance>, out: &Object) {
        let Ok(unwound) = self.unwind(ti) else {
            return;
        };
        let TypeInstance::Realized {
            ty,
            specializations,
            ..
        } = &*unwound
        else {
            return;
        };
        if ty.class != TypeClass::Struct {
            return;
        }
        let Ok(members) = self.members_of(ty) else {
            return;
        };
        for (member, owner) in members {
            let Some(decl) = &member.decl else {
                continue;
            };
            let Some(value) = out.dict_get(&member.name) else {
                continue;
            };
            let Ok(member_ti) = self.member_instance(decl, &owner, ty, specializations) else {
                continue;
            };
            if let Ok(retagged) = self.retag_integer(&member_ti, value.clone()) {
                if !retagged.ptr_eq(&value) {
                    out.dict_set(member.name.clone(), retagged);
                }
            }
        }
    }

    /// Resolve a `%type` reference, preferring the `%realm` namespace.
    fn instantiate_realmed(
        &self,
        type_name: &str,
        realm: Option<&str>,
    ) -> Result<Arc<TypeInstance>> {
        if let Some(realm) = realm {
            if let Ok(ti) = self.instantiate(&format!("{}.{}", realm, type_name)) {
                return Ok(ti);
            }
        }
        self.instantiate(type_name)
    }

    /// Codecs canonicalize integer signedness; the declared builtin
    /// wins it back.
    fn retag_integer(&self, ti: &Arc<TypeInstance>, obj: Object) -> Result<Object> {
        let unwound = self.unwind(ti)?;
        let Some(ty) = unwound.realized_type() else {
            return Ok(obj);
        };
        if ty.class != TypeClass::Builtin {
            return Ok(obj);
        }
        let retagged = match ty.name.as_str() {
            "int64" => match obj.as_integer() {
                Some(v) if obj.as_i64().is_none() => Object::int64(v),
                _ => obj,
            },
            "uint64" => match obj.as_i64() {
                Some(v) if v >= 0 => Object::uint64(v as u64),
                _ => obj,
            },
            _ => obj,
        };
        Ok(retagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_without_annotations() {
        let ctx = TypingContext::new();
        let obj = Object::array_from([Object::from(1i64), Object::from("x")]);
        let wire = ctx.serialize(&obj).unwrap();
        assert_eq!(wire, obj);
        let back = ctx.deserialize(&wire).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn builtin_annotation_roundtrip() {
        let ctx = TypingContext::new();
        let obj = Object::int64(5);
        ctx.annotate(&obj, "int64").unwrap();
        let wire = ctx.serialize(&obj).unwrap();
        // {"%type": "int64", "%value": 5}
        let tn = wire.dict_get(TYPE_KEY).unwrap();
        assert_eq!(tn.as_str(), Some("int64"));
        let back = ctx.deserialize(&wire).unwrap();
        assert_eq!(back, obj);
        let annotation = back.type_instance().expect("annotation survives");
        assert_eq!(annotation.canonical_form(), "int64");
    }

    #[test]
    fn uint64_wire_value_retagged_for_int64() {
        let ctx = TypingContext::new();
        let wire = Object::dictionary();
        wire.dict_set(TYPE_KEY, Object::from("int64"));
        wire.dict_set(VALUE_KEY, Object::uint64(9));
        let back = ctx.deserialize(&wire).unwrap();
        assert_eq!(back.as_i64(), Some(9));
    }

    #[test]
    fn unknown_type_fails_deserialize() {
        let ctx = TypingContext::new();
        let wire = Object::dictionary();
        wire.dict_set(TYPE_KEY, Object::from("NoSuchType"));
        wire.dict_set(VALUE_KEY, Object::null());
        let err = ctx.deserialize(&wire).unwrap_err();
        assert_eq!(err.code(), libc::EINVAL);
    }

    #[test]
    fn realm_scopes_lookup() {
        let ctx = TypingContext::new();
        // Builtins resolve without a realm; an unrelated realm must
        // not break the fallback.
        let wire = Object::dictionary();
        wire.dict_set(TYPE_KEY, Object::from("string"));
        wire.dict_set(REALM_KEY, Object::from("com.example"));
        wire.dict_set(VALUE_KEY, Object::from("v"));
        let back = ctx.deserialize(&wire).unwrap();
        assert_eq!(back.as_str(), Some("v"));
    }
}
