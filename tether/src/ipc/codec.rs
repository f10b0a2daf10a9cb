//! Payload codecs for events crossing process boundaries.
//!
//! In-process payloads are `Arc<dyn Any>`; on the wire they become bytes.
//! Each signature type tag that may leave the process registers an
//! [`EventCodec`]. Sending or receiving an event whose tag has no codec fails
//! and the frame is dropped.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::dispatch::{Payload, Signature};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),
    #[error("payload of {tag} is not a {expected}")]
    TypeMismatch { tag: String, expected: &'static str },
    #[error("no codec registered for {0}")]
    UnknownTag(String),
    #[error("{tag} has no operation {id}")]
    UnknownOperation { tag: String, id: String },
    #[error("{0} carries no payload")]
    UnexpectedPayload(String),
}

/// Converts payloads of one type tag to and from bytes.
pub trait EventCodec: Send + Sync {
    /// # Errors
    ///
    /// Fails if the payload is not of the expected type.
    fn encode(&self, signature: &Signature, payload: &Payload) -> Result<Vec<u8>, CodecError>;

    /// # Errors
    ///
    /// Fails on malformed bytes.
    fn decode(&self, signature: &Signature, bytes: &[u8]) -> Result<Payload, CodecError>;
}

/// Codec for a tag whose every event carries a `T`.
pub struct TypedCodec<T>(PhantomData<fn() -> T>);

impl<T> TypedCodec<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for TypedCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventCodec for TypedCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self, signature: &Signature, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        encode_as::<T>(signature, payload)
    }

    fn decode(&self, _signature: &Signature, bytes: &[u8]) -> Result<Payload, CodecError> {
        decode_as::<T>(bytes)
    }
}

/// Downcasts `payload` to `T` and postcard-encodes it.
pub(crate) fn encode_as<T>(signature: &Signature, payload: &Payload) -> Result<Vec<u8>, CodecError>
where
    T: Serialize + 'static,
{
    let value = (**payload)
        .downcast_ref::<T>()
        .ok_or_else(|| CodecError::TypeMismatch {
            tag: signature.type_tag().to_owned(),
            expected: std::any::type_name::<T>(),
        })?;
    Ok(postcard::to_allocvec(value)?)
}

pub(crate) fn decode_as<T>(bytes: &[u8]) -> Result<Payload, CodecError>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    let value: T = postcard::from_bytes(bytes)?;
    Ok(Arc::new(value))
}

/// Type tag to codec table, shared by the IPC threads.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: RwLock<HashMap<String, Arc<dyn EventCodec>>>,
}

impl CodecRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `codec` for `type_tag`, replacing any previous one.
    pub fn register(&self, type_tag: impl Into<String>, codec: Arc<dyn EventCodec>) {
        self.codecs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(type_tag.into(), codec);
    }

    /// Shorthand for a [`TypedCodec`].
    pub fn register_typed<T>(&self, type_tag: impl Into<String>)
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register(type_tag, Arc::new(TypedCodec::<T>::new()));
    }

    #[must_use]
    pub fn contains(&self, type_tag: &str) -> bool {
        self.codecs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(type_tag)
    }

    fn get(&self, type_tag: &str) -> Result<Arc<dyn EventCodec>, CodecError> {
        self.codecs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(type_tag)
            .cloned()
            .ok_or_else(|| CodecError::UnknownTag(type_tag.to_owned()))
    }

    /// # Errors
    ///
    /// [`CodecError::UnknownTag`] if no codec is registered for the tag.
    pub fn encode(&self, signature: &Signature, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        self.get(signature.type_tag())?.encode(signature, payload)
    }

    /// # Errors
    ///
    /// [`CodecError::UnknownTag`] if no codec is registered for the tag.
    pub fn decode(&self, signature: &Signature, bytes: &[u8]) -> Result<Payload, CodecError> {
        self.get(signature.type_tag())?.decode(signature, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Temperature {
        celsius: i16,
    }

    #[test]
    fn typed_codec_carries_the_value() {
        let registry = CodecRegistry::new();
        registry.register_typed::<Temperature>("sensor");
        let sig = Signature::new("sensor", "reading");
        let payload: Payload = Arc::new(Temperature { celsius: -4 });

        let bytes = registry.encode(&sig, &payload).unwrap();
        let decoded = registry.decode(&sig, &bytes).unwrap();
        assert_eq!((*decoded).downcast_ref::<Temperature>(), Some(&Temperature { celsius: -4 }));
    }

    #[test]
    fn unknown_tag_is_refused() {
        let registry = CodecRegistry::new();
        let sig = Signature::new("sensor", "reading");
        let payload: Payload = Arc::new(1u8);
        assert!(matches!(registry.encode(&sig, &payload), Err(CodecError::UnknownTag(_))));
        assert!(matches!(registry.decode(&sig, &[1]), Err(CodecError::UnknownTag(_))));
    }

    #[test]
    fn wrong_payload_type_is_a_mismatch() {
        let registry = CodecRegistry::new();
        registry.register_typed::<Temperature>("sensor");
        let payload: Payload = Arc::new("hot".to_owned());
        let result = registry.encode(&Signature::new("sensor", "reading"), &payload);
        assert!(matches!(result, Err(CodecError::TypeMismatch { .. })));
    }
}
