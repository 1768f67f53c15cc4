//! Wire protocol shared by the developer machine and the deployed stub.
//!
//! Every message crossing the broker is an [`Envelope`] serialized to JSON and
//! split into [`Fragment`]s. Envelopes that would be too large for the broker
//! are replaced by a single pointer envelope referencing an object in bulk
//! storage; see [`PointerProperties`].

pub mod codec;
pub mod envelope;
pub mod error;
pub mod event;

pub use codec::{Reassembler, encode_fragments, split_chunks};
pub use envelope::{
    CHUNK_SIZE, Envelope, Fragment, POINTER_TYPE, PointerProperties, STORAGE_THRESHOLD,
};
pub use error::ProtoError;
pub use event::{
    BuildFailed, Event, EventKind, FileChanged, FunctionAck, FunctionError, FunctionRef,
    FunctionSuccess, FunctionTimeout, Invocation, InvocationContext, WorkerOutput, WorkerRef,
};
