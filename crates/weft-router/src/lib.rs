pub mod broker;
pub mod inproc;
pub mod rest;
pub mod retry;
pub mod router;
pub mod transport;

pub use broker::{Completion, CompletionBroker, PendingCompletion};
pub use inproc::InProcTransport;
pub use rest::RestTransport;
pub use retry::RetryPolicy;
pub use router::{Dispatched, ExecutorHandle, ExecutorRouter};
pub use transport::{ChunkStream, Transport, TransportRequest};
