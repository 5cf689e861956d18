use std::fmt;
use std::marker::PhantomData;

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Encoding of journal records.
pub(crate) fn bincode_config() -> impl Options {
    bincode::DefaultOptions::new().allow_trailing_bytes()
}

/// A value kept in its encoded form until somebody asks for it.
///
/// Journal readers that only scan events do not pay for decoding large payloads.
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct Serialized<T> {
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
    #[serde(skip)]
    value_type: PhantomData<fn() -> T>,
}

impl<T> Clone for Serialized<T> {
    fn clone(&self) -> Self {
        Serialized {
            data: self.data.clone(),
            value_type: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Serialized<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serialized({} bytes)", self.data.len())
    }
}

impl<T: Serialize + DeserializeOwned> Serialized<T> {
    pub fn new(value: &T) -> bincode::Result<Self> {
        let data = bincode_config().serialize(value)?;
        Ok(Serialized {
            data,
            value_type: PhantomData,
        })
    }

    pub fn deserialize(&self) -> bincode::Result<T> {
        bincode_config().deserialize(&self.data)
    }
}
