//! Data-driven interface descriptions.
//!
//! ```ignore
//! let contract = ServiceContract::new("player")
//!     .method::<Track>("play")
//!     .method_with_response::<Query, Status>("status")
//!     .attribute::<u8>("volume")
//!     .into_shared();
//! ```
//!
//! Method events use the type tag `"<interface>::method"` and attribute
//! events `"<interface>::attribute"`; the signature id is the method or
//! attribute name. Registering the contract's codecs lets these events cross
//! process boundaries.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::dispatch::{Interaction, Payload, Signature};
use crate::ipc::codec::{decode_as, encode_as};
use crate::ipc::{CodecError, CodecRegistry, EventCodec};

type EncodeFn = fn(&Signature, &Payload) -> Result<Vec<u8>, CodecError>;
type DecodeFn = fn(&[u8]) -> Result<Payload, CodecError>;

#[derive(Clone, Copy)]
struct PayloadCodec {
    encode: EncodeFn,
    decode: DecodeFn,
}

impl PayloadCodec {
    fn of<T>() -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Self {
            encode: encode_as::<T>,
            decode: decode_as::<T>,
        }
    }
}

/// One method of a contract.
pub struct MethodSpec {
    name: String,
    request: PayloadCodec,
    response: Option<PayloadCodec>,
}

impl MethodSpec {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Methods without a response are fire-and-forget: no correlation on
    /// the client, no busy gate on the server.
    #[must_use]
    pub const fn has_response(&self) -> bool {
        self.response.is_some()
    }
}

/// One attribute of a contract.
pub struct AttributeSpec {
    name: String,
    value: PayloadCodec,
}

impl AttributeSpec {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Description of a service interface.
pub struct ServiceContract {
    interface: String,
    method_tag: String,
    attribute_tag: String,
    methods: BTreeMap<String, MethodSpec>,
    attributes: BTreeMap<String, AttributeSpec>,
}

impl ServiceContract {
    pub fn new(interface: impl Into<String>) -> Self {
        let interface = interface.into();
        Self {
            method_tag: format!("{interface}::method"),
            attribute_tag: format!("{interface}::attribute"),
            interface,
            methods: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds a method without a response.
    #[must_use]
    pub fn method<Req>(mut self, name: impl Into<String>) -> Self
    where
        Req: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let name = name.into();
        self.methods.insert(
            name.clone(),
            MethodSpec {
                name,
                request: PayloadCodec::of::<Req>(),
                response: None,
            },
        );
        self
    }

    /// Adds a method answered with a `Resp`.
    #[must_use]
    pub fn method_with_response<Req, Resp>(mut self, name: impl Into<String>) -> Self
    where
        Req: Serialize + DeserializeOwned + Send + Sync + 'static,
        Resp: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let name = name.into();
        self.methods.insert(
            name.clone(),
            MethodSpec {
                name,
                request: PayloadCodec::of::<Req>(),
                response: Some(PayloadCodec::of::<Resp>()),
            },
        );
        self
    }

    #[must_use]
    pub fn attribute<T>(mut self, name: impl Into<String>) -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let name = name.into();
        self.attributes.insert(
            name.clone(),
            AttributeSpec {
                name,
                value: PayloadCodec::of::<T>(),
            },
        );
        self
    }

    #[must_use]
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    #[must_use]
    pub fn method_tag(&self) -> &str {
        &self.method_tag
    }

    #[must_use]
    pub fn attribute_tag(&self) -> &str {
        &self.attribute_tag
    }

    #[must_use]
    pub fn method_spec(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.get(name)
    }

    #[must_use]
    pub fn attribute_spec(&self, name: &str) -> Option<&AttributeSpec> {
        self.attributes.get(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodSpec> {
        self.methods.values()
    }

    pub fn attributes(&self) -> impl Iterator<Item = &AttributeSpec> {
        self.attributes.values()
    }

    /// Installs codecs for both type tags of this contract.
    pub fn register_codecs(self: &Arc<Self>, codecs: &CodecRegistry) {
        codecs.register(self.method_tag.clone(), Arc::new(MethodCodec(Arc::clone(self))));
        codecs.register(
            self.attribute_tag.clone(),
            Arc::new(AttributeCodec(Arc::clone(self))),
        );
    }

    fn method_codec(&self, signature: &Signature) -> Result<PayloadCodec, CodecError> {
        let spec = self
            .methods
            .get(signature.id())
            .ok_or_else(|| unknown(signature))?;
        match signature.route().map(|r| r.interaction) {
            Some(Interaction::Request) => Ok(spec.request),
            Some(Interaction::Response) => spec.response.ok_or_else(|| unexpected(signature)),
            _ => Err(unexpected(signature)),
        }
    }

    fn attribute_codec(&self, signature: &Signature) -> Result<PayloadCodec, CodecError> {
        let spec = self
            .attributes
            .get(signature.id())
            .ok_or_else(|| unknown(signature))?;
        match signature.route().map(|r| r.interaction) {
            Some(Interaction::Notification) => Ok(spec.value),
            _ => Err(unexpected(signature)),
        }
    }
}

fn unknown(signature: &Signature) -> CodecError {
    CodecError::UnknownOperation {
        tag: signature.type_tag().to_owned(),
        id: signature.id().to_owned(),
    }
}

fn unexpected(signature: &Signature) -> CodecError {
    CodecError::UnexpectedPayload(signature.to_string())
}

struct MethodCodec(Arc<ServiceContract>);

impl EventCodec for MethodCodec {
    fn encode(&self, signature: &Signature, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        (self.0.method_codec(signature)?.encode)(signature, payload)
    }

    fn decode(&self, signature: &Signature, bytes: &[u8]) -> Result<Payload, CodecError> {
        (self.0.method_codec(signature)?.decode)(bytes)
    }
}

struct AttributeCodec(Arc<ServiceContract>);

impl EventCodec for AttributeCodec {
    fn encode(&self, signature: &Signature, payload: &Payload) -> Result<Vec<u8>, CodecError> {
        (self.0.attribute_codec(signature)?.encode)(signature, payload)
    }

    fn decode(&self, signature: &Signature, bytes: &[u8]) -> Result<Payload, CodecError> {
        (self.0.attribute_codec(signature)?.decode)(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::rpc_signature;
    use crate::types::{SeqId, ServiceId};

    fn contract() -> Arc<ServiceContract> {
        ServiceContract::new("player")
            .method::<String>("play")
            .method_with_response::<u32, bool>("seek")
            .attribute::<u8>("volume")
            .into_shared()
    }

    fn sig(tag: &str, id: &str, interaction: Interaction) -> Signature {
        rpc_signature(tag, id, "main", interaction, ServiceId(0), ServiceId(1), SeqId(1))
    }

    #[test]
    fn tags_follow_the_interface_name() {
        let c = contract();
        assert_eq!(c.method_tag(), "player::method");
        assert_eq!(c.attribute_tag(), "player::attribute");
        assert!(!c.method_spec("play").unwrap().has_response());
        assert!(c.method_spec("seek").unwrap().has_response());
    }

    #[test]
    fn codecs_pick_the_type_per_interaction() {
        let c = contract();
        let codecs = CodecRegistry::new();
        c.register_codecs(&codecs);

        let request = sig("player::method", "seek", Interaction::Request);
        let bytes = codecs.encode(&request, &(Arc::new(90u32) as Payload)).unwrap();
        let decoded = codecs.decode(&request, &bytes).unwrap();
        assert_eq!((*decoded).downcast_ref::<u32>(), Some(&90));

        let response = sig("player::method", "seek", Interaction::Response);
        let bytes = codecs.encode(&response, &(Arc::new(true) as Payload)).unwrap();
        let decoded = codecs.decode(&response, &bytes).unwrap();
        assert_eq!((*decoded).downcast_ref::<bool>(), Some(&true));

        let notification = sig("player::attribute", "volume", Interaction::Notification);
        assert!(codecs.encode(&notification, &(Arc::new(7u8) as Payload)).is_ok());
    }

    #[test]
    fn unknown_operations_and_payloads_are_refused() {
        let c = contract();
        let codecs = CodecRegistry::new();
        c.register_codecs(&codecs);

        let missing = sig("player::method", "stop", Interaction::Request);
        assert!(matches!(
            codecs.encode(&missing, &(Arc::new(()) as Payload)),
            Err(CodecError::UnknownOperation { .. })
        ));
        let no_response = sig("player::method", "play", Interaction::Response);
        assert!(matches!(
            codecs.encode(&no_response, &(Arc::new(()) as Payload)),
            Err(CodecError::UnexpectedPayload(_))
        ));
    }
}
