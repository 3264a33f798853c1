//! Serverless PostgreSQL: the wire protocol tunnelled over WebSockets, and
//! one-shot queries over HTTP.
//!
//! **Features:** pipelined TLS and startup, coalesced writes, async SCRAM-SHA-256,
//! batched non-interactive transactions.
//!
//! ```ignore
//! // Session over a WebSocket
//! let mut client = Client::connect(ClientConfig::from_connection_string(url)?).await?;
//! let result = client.query("SELECT now()").await?;
//!
//! // Stateless over HTTP
//! let db = HttpClient::new(url)?;
//! let rows = db.query("SELECT $1::text AS greeting", vec!["hi".into()]).await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod protocol;
pub mod result;
pub mod socket;
pub mod types;

pub use client::{Client, ClientConfig};
pub use config::{Endpoint, PipelineConnect, ServerlessConfig};
pub use error::{DatabaseError, ServerlessError, ServerlessResult};
pub use http::{
    AuthToken, FetchOptions, HttpClient, HttpQueryOptions, IsolationLevel, Param, ParameterizedQuery,
    PreparedQuery, TransactionOptions,
};
pub use protocol::{BlockingPoolCrypto, CryptoProvider, ScramSession};
pub use result::{FieldDef, QueryOutput, QueryResult};
pub use socket::{SocketEvent, SocketEvents, TransportState, WsSocket};
pub use types::TypeParsers;
