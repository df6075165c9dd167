//! Wire layer between the pipeline editor and external applications.
//!
//! * [`specification`] loads the API document and compiles one validator per
//!   endpoint.
//! * [`endpoint`] is the bidirectional JSON-RPC endpoint that gates every
//!   message through those validators.
//! * [`socket`] and [`window`] are the two transports.

pub mod chunk;
pub mod endpoint;
pub mod jsonrpc;
pub mod message;
pub mod method;
pub mod socket;
pub mod specification;
pub mod transport;
pub mod validator;
pub mod window;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_util;

pub use endpoint::{HandlerError, RequestHandler, RpcEndpoint, RpcError, TransportSink};
pub use specification::{ApiSpecification, EndpointGroup, SpecError};
pub use transport::{Channel, FrameSink, Transport, TransportError};
