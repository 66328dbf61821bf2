// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Named codecs mapping an [`Object`] tree to and from octet buffers.
//!
//! Codecs live in a process-global registry keyed by name. The three
//! defaults (`msgpack`, `yaml`, `json`) self-register on first use;
//! applications may add their own with [`register`].

mod json;
mod msgpack;
mod yaml;

pub use json::JsonSerializer;
pub use msgpack::MsgpackSerializer;
pub use yaml::YamlSerializer;

use crate::error::{Error, Result};
use crate::object::Object;
use std::sync::{Arc, OnceLock, RwLock};

/// Wire codec for the object model.
pub trait Serializer: Send + Sync {
    /// Registry key (`msgpack`, `yaml`, `json`, ...).
    fn name(&self) -> &'static str;

    /// Encode an object tree into an octet buffer.
    fn serialize(&self, obj: &Object) -> Result<Vec<u8>>;

    /// Decode an octet buffer back into an object tree.
    fn deserialize(&self, buf: &[u8]) -> Result<Object>;
}

fn registry() -> &'static RwLock<Vec<Arc<dyn Serializer>>> {
    static REGISTRY: OnceLock<RwLock<Vec<Arc<dyn Serializer>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        RwLock::new(vec![
            Arc::new(MsgpackSerializer) as Arc<dyn Serializer>,
            Arc::new(YamlSerializer),
            Arc::new(JsonSerializer),
        ])
    })
}

/// Register a codec, replacing any prior codec with the same name.
pub fn register(codec: Arc<dyn Serializer>) {
    if let Ok(mut reg) = registry().write() {
        log::debug!("serializer registry: registered '{}'", codec.name());
        reg.retain(|c| c.name() != codec.name());
        reg.push(codec);
    }
}

/// Look up a codec by name. ENOENT when absent.
pub fn find(name: &str) -> Result<Arc<dyn Serializer>> {
    registry()
        .read()
        .ok()
        .and_then(|reg| reg.iter().find(|c| c.name() == name).cloned())
        .ok_or_else(|| Error::NotFound(format!("serializer '{}'", name)))
}

/// Names of all registered codecs.
pub fn names() -> Vec<&'static str> {
    registry()
        .read()
        .map(|reg| reg.iter().map(|c| c.name()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ErrorObject;

    fn sample_objects() -> Vec<Object> {
        vec![
            Object::null(),
            Object::boolean(true),
            Object::boolean(false),
            Object::uint64(0),
            Object::uint64(u64::from(u32::MAX)),
            Object::int64(-42),
            Object::int64(i64::MIN),
            Object::double(1.5),
            Object::double(-0.25),
            Object::date(0),
            Object::date(i64::from(i32::MAX)),
            Object::string(""),
            Object::string("héllo wörld"),
            Object::binary(Vec::new()),
            Object::binary(vec![0, 1, 2, 255]),
            Object::array(),
            Object::array_from([Object::from(1u64), Object::from("x"), Object::null()]),
            Object::dictionary(),
            {
                let d = Object::dictionary();
                d.dict_set("nested", Object::array_from([Object::from(true)]));
                d.dict_set("n", Object::from(3u64));
                d
            },
            Object::error(
                ErrorObject::new(libc::EINVAL, "boom").with_extra(Object::from("ctx")),
            ),
        ]
    }

    #[test]
    fn default_codecs_present() {
        for name in ["msgpack", "yaml", "json"] {
            assert_eq!(find(name).unwrap().name(), name);
        }
        assert!(find("cbor").is_err());
    }

    #[test]
    fn every_codec_roundtrips_every_sample() {
        for name in ["msgpack", "yaml", "json"] {
            let codec = find(name).unwrap();
            for obj in sample_objects() {
                let buf = codec.serialize(&obj).unwrap();
                let back = codec.deserialize(&buf).unwrap();
                assert_eq!(back, obj, "codec {} failed on {:?}", name, obj);
            }
        }
    }

    #[test]
    fn array_order_preserved() {
        let arr = Object::array_from((0..32u64).map(Object::from));
        for name in ["msgpack", "yaml", "json"] {
            let codec = find(name).unwrap();
            let back = codec.deserialize(&codec.serialize(&arr).unwrap()).unwrap();
            for i in 0..32u64 {
                assert_eq!(back.get(i as usize).unwrap().as_u64(), Some(i));
            }
        }
    }

    #[test]
    fn dictionary_key_set_preserved() {
        let dict = Object::dictionary();
        for i in 0..16u64 {
            dict.dict_set(format!("key{}", i), Object::from(i));
        }
        for name in ["msgpack", "yaml", "json"] {
            let codec = find(name).unwrap();
            let back = codec.deserialize(&codec.serialize(&dict).unwrap()).unwrap();
            assert_eq!(back.dict_keys(), dict.dict_keys());
        }
    }

    #[test]
    fn deep_nesting_roundtrips() {
        let mut obj = Object::from("leaf");
        for _ in 0..8 {
            let d = Object::dictionary();
            d.dict_set("inner", obj);
            obj = d;
        }
        for name in ["msgpack", "yaml", "json"] {
            let codec = find(name).unwrap();
            let back = codec.deserialize(&codec.serialize(&obj).unwrap()).unwrap();
            assert_eq!(back, obj);
        }
    }
}
