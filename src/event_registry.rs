//! Registry mapping event type names to typed encoders/decoders.
//!
//! Mirrors the name -> factory lookup used by the control plane's command
//! registry, but for domain events instead of commands: a caller registers
//! each concrete `NetworkEvent` type once, and the messaging layer and event
//! service both decode by type name without matching on concrete types.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ConexusError;
use crate::message::NetworkEvent;

/// Fallback decoder for an event type whose wire payload isn't a JSON object
/// the primary JSON codec can decode (an opaque blob produced outside this
/// crate, for instance). Consulted by `decode_event` only after the JSON path
/// is unavailable or fails.
pub type CustomEventDecoder = Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn NetworkEvent>, ConexusError> + Send + Sync>;

trait EventCodec: Send + Sync {
    fn encode(&self, event: &dyn NetworkEvent) -> Result<serde_json::Value, ConexusError>;
    fn decode(&self, payload: &serde_json::Value) -> Result<Arc<dyn NetworkEvent>, ConexusError>;
}

struct TypedEventCodec<T> {
    custom_decoder: Option<CustomEventDecoder>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> TypedEventCodec<T> {
    fn new(custom_decoder: Option<CustomEventDecoder>) -> Self {
        Self { custom_decoder, _marker: std::marker::PhantomData }
    }
}

impl<T> EventCodec for TypedEventCodec<T>
where
    T: NetworkEvent + Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, event: &dyn NetworkEvent) -> Result<serde_json::Value, ConexusError> {
        let concrete = (event.as_any() as &dyn Any)
            .downcast_ref::<T>()
            .ok_or_else(|| ConexusError::SerializationError(format!(
                "event claims type {:?} but does not match the registered Rust type",
                event.event_type_name()
            )))?;
        // Primary path is JSON; if a concrete type somehow can't serialize to
        // JSON (e.g. a NaN float), fall back to its Debug rendering rather
        // than failing the broadcast outright.
        Ok(serde_json::to_value(concrete).unwrap_or_else(|_| serde_json::Value::String(format!("{concrete:?}"))))
    }

    fn decode(&self, payload: &serde_json::Value) -> Result<Arc<dyn NetworkEvent>, ConexusError> {
        if payload.is_object() {
            match serde_json::from_value::<T>(payload.clone()) {
                Ok(value) => return Ok(Arc::new(value)),
                Err(err) => {
                    if let Some(decoder) = &self.custom_decoder {
                        return decoder(payload);
                    }
                    return Err(ConexusError::DeserializationError(err.to_string()));
                }
            }
        }

        match &self.custom_decoder {
            Some(decoder) => decoder(payload),
            None => Err(ConexusError::DeserializationError(
                "payload is not a JSON object and no custom decoder is registered for this type".to_string(),
            )),
        }
    }
}

/// Concurrent name -> codec map. Constructed by the caller and shared between
/// `MessagingService` and `CrossServerEventService` (there is no process-wide
/// static registry).
#[derive(Default)]
pub struct EventRegistry {
    codecs: RwLock<HashMap<String, Arc<dyn EventCodec>>>,
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("registered_type_names", &self.registered_type_names())
            .finish()
    }
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a concrete event type under `type_name`. Re-registering the
    /// same name overwrites the previous entry.
    pub fn register<T>(&self, type_name: impl Into<String>)
    where
        T: NetworkEvent + Serialize + DeserializeOwned + 'static,
    {
        self.register_with_decoder::<T>(type_name, None);
    }

    /// Register a concrete event type with an optional custom decoder used
    /// when the wire payload isn't a plain JSON object the derived
    /// `Deserialize` impl can consume.
    pub fn register_with_decoder<T>(&self, type_name: impl Into<String>, custom_decoder: Option<CustomEventDecoder>)
    where
        T: NetworkEvent + Serialize + DeserializeOwned + 'static,
    {
        let type_name = type_name.into();
        tracing::debug!(type_name, "event registry: registered type");
        self.codecs
            .write()
            .expect("EventRegistry.register: lock poisoned")
            .insert(type_name, Arc::new(TypedEventCodec::<T>::new(custom_decoder)));
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.codecs.read().expect("EventRegistry.is_registered: lock poisoned").contains_key(type_name)
    }

    pub fn registered_type_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.codecs.read().expect("EventRegistry.registered_type_names: lock poisoned").keys().cloned().collect();
        names.sort();
        names
    }

    pub fn encode_event(&self, event: &dyn NetworkEvent) -> Result<serde_json::Value, ConexusError> {
        let type_name = event.event_type_name();
        let codec = self
            .codecs
            .read()
            .expect("EventRegistry.encode_event: lock poisoned")
            .get(type_name)
            .cloned()
            .ok_or_else(|| ConexusError::UnknownEventType(type_name.to_string()))?;
        codec.encode(event)
    }

    pub fn decode_event(&self, type_name: &str, payload: &serde_json::Value) -> Result<Arc<dyn NetworkEvent>, ConexusError> {
        let codec = self
            .codecs
            .read()
            .expect("EventRegistry.decode_event: lock poisoned")
            .get(type_name)
            .cloned()
            .ok_or_else(|| ConexusError::UnknownEventType(type_name.to_string()))?;
        codec.decode(payload)
    }
}
