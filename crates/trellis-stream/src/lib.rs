//! trellis-stream: the writer and reader halves of the Trellis protocol.
//!
//! The writer walks a partially-computed value graph and streams rows as
//! subtrees become ready. The reader ingests those rows and exposes a graph
//! whose unfinished parts suspend the caller instead of blocking it.

pub mod bridge;
pub mod reader;
pub mod writer;

pub use reader::{open, ModuleLoader, NoModules, ReadError, Response, ResponseState, Suspension};
pub use writer::{render, AbortHandle, Node, Produce, Producer, RenderOptions, RenderStream};
