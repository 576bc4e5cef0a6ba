//! Packing and unpacking of `(function, args, kwargs)` payloads, and the
//! registry workers resolve function names against.
//!
//! The payload is opaque to the transport, the interchange and the fabric
//! coordinator; only `submit` and the worker interpret it. Large values are
//! spilled into out-of-band buffers so the header stays small: a single
//! argument of [`BUFFER_THRESHOLD`] bytes or more is moved out of line, and
//! an args/kwargs collection with more than [`ITEM_THRESHOLD`] entries is
//! spilled whole.

use crate::error::Error;
use crate::HashMap;
use serde::{Deserialize, Serialize};
use std::any::Any;

/// Arguments of this size or larger are carried out-of-band.
pub const BUFFER_THRESHOLD: usize = 1024 * 1024;

/// Collections with more entries than this are carried out-of-band.
pub const ITEM_THRESHOLD: usize = 1024;

/// What a task invocation evaluates to on a worker.
pub type TaskOutput = Result<Vec<u8>, RemoteException>;

/// An error raised by user code on a worker, reconstructed client-side.
///
/// Round-trips the error kind and message text across the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteException {
    pub kind: String,
    pub message: String,
}

impl RemoteException {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Builds an exception from a captured panic payload.
    pub fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = panic.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = panic.downcast_ref::<String>() {
            text.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self::new("Panic", message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Slot {
    Inline(Vec<u8>),
    /// Index into the out-of-band buffer list.
    Spill(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum ArgsBlock {
    Inline(Vec<Slot>),
    Spilled(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum KwargsBlock {
    Inline(Vec<(String, Slot)>),
    Spilled(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ApplyMessage {
    function: String,
    args: ArgsBlock,
    kwargs: KwargsBlock,
    buffers: Vec<Vec<u8>>,
}

fn slot(bytes: Vec<u8>, buffers: &mut Vec<Vec<u8>>) -> Slot {
    if bytes.len() >= BUFFER_THRESHOLD {
        let index = buffers.len();
        buffers.push(bytes);
        Slot::Spill(index)
    } else {
        Slot::Inline(bytes)
    }
}

/// Serializes an invocation into an opaque payload.
pub fn pack_apply(
    function: &str,
    args: Vec<Vec<u8>>,
    kwargs: HashMap<String, Vec<u8>>,
) -> Result<Vec<u8>, Error> {
    let mut buffers = Vec::new();

    let args = if args.len() > ITEM_THRESHOLD {
        let index = buffers.len();
        buffers.push(bincode::serialize(&args)?);
        ArgsBlock::Spilled(index)
    } else {
        ArgsBlock::Inline(args.into_iter().map(|a| slot(a, &mut buffers)).collect())
    };

    // sort kwargs so the packed form is deterministic
    let mut pairs: Vec<(String, Vec<u8>)> = kwargs.into_iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    let kwargs = if pairs.len() > ITEM_THRESHOLD {
        let index = buffers.len();
        buffers.push(bincode::serialize(&pairs)?);
        KwargsBlock::Spilled(index)
    } else {
        KwargsBlock::Inline(
            pairs
                .into_iter()
                .map(|(k, v)| (k, slot(v, &mut buffers)))
                .collect(),
        )
    };

    let message = ApplyMessage {
        function: function.to_string(),
        args,
        kwargs,
        buffers,
    };
    Ok(bincode::serialize(&message)?)
}

/// Deserializes a payload back into `(function, args, kwargs)`.
pub fn unpack_apply(buffer: &[u8]) -> Result<(String, Vec<Vec<u8>>, HashMap<String, Vec<u8>>), Error> {
    let message: ApplyMessage = bincode::deserialize(buffer)?;
    let ApplyMessage {
        function,
        args,
        kwargs,
        buffers,
    } = message;

    let fetch = |index: usize| -> Result<Vec<u8>, Error> {
        buffers.get(index).cloned().ok_or_else(|| {
            Error::BadMessage(format!("apply message references missing buffer {}", index))
        })
    };
    let resolve = |slot: Slot| -> Result<Vec<u8>, Error> {
        match slot {
            Slot::Inline(bytes) => Ok(bytes),
            Slot::Spill(index) => fetch(index),
        }
    };

    let args: Vec<Vec<u8>> = match args {
        ArgsBlock::Inline(slots) => slots
            .into_iter()
            .map(|slot| resolve(slot))
            .collect::<Result<_, _>>()?,
        ArgsBlock::Spilled(index) => bincode::deserialize(&fetch(index)?)?,
    };

    let kwargs = match kwargs {
        KwargsBlock::Inline(pairs) => pairs
            .into_iter()
            .map(|(k, v)| Ok((k, resolve(v)?)))
            .collect::<Result<HashMap<_, _>, Error>>()?,
        KwargsBlock::Spilled(index) => {
            let pairs: Vec<(String, Vec<u8>)> = bincode::deserialize(&fetch(index)?)?;
            pairs.into_iter().collect()
        }
    };

    Ok((function, args, kwargs))
}

type TaskFn = Box<dyn Fn(&[Vec<u8>], &HashMap<String, Vec<u8>>) -> TaskOutput + Send + Sync>;

/// Named functions a worker can execute.
///
/// The embedding program registers its functions once at fabric startup;
/// workers resolve incoming payloads against the registry by name.
#[derive(Default)]
pub struct Registry {
    functions: HashMap<String, TaskFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&[Vec<u8>], &HashMap<String, Vec<u8>>) -> TaskOutput + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Box::new(function));
    }

    /// Unpacks a payload and runs the named function.
    ///
    /// Every failure mode (undecodable payload, unknown function, user
    /// error) comes back as a `RemoteException` so the worker can report it
    /// without dying.
    pub fn run(&self, buffer: &[u8]) -> TaskOutput {
        let (function, args, kwargs) = unpack_apply(buffer)
            .map_err(|e| RemoteException::new("UnpackError", e.to_string()))?;
        let task_fn = self.functions.get(&function).ok_or_else(|| {
            RemoteException::new(
                "FunctionNotFound",
                format!("no function {:?} registered", function),
            )
        })?;
        task_fn(&args, &kwargs)
    }
}

/// Registry with the stock demo functions: `identity` echoes its first
/// argument, `concat` joins all arguments.
pub fn builtin() -> Registry {
    let mut registry = Registry::new();
    registry.register("identity", |args, _kwargs| {
        Ok(args.first().cloned().unwrap_or_default())
    });
    registry.register("concat", |args, _kwargs| {
        Ok(args.iter().flat_map(|a| a.iter().copied()).collect())
    });
    registry
}
