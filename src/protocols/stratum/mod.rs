//! Stratum v1 protocol implementation.
//!
//! Line-delimited JSON-RPC between mining clients and the proxy:
//! - Client sends `{"id": <number|string|null>, "method": <string>, "params": [...]}`
//! - Proxy answers `{"id": <same id>, "result": <any>, "error": [code, message, data] | null}`
//!
//! ## Supported Methods
//!
//! - `mining.subscribe`: marks the session subscribed and assigns an extranonce1
//! - `mining.authorize`: records the worker name
//! - `mining.submit`: hashes the submitted work and accepts it only if the
//!   hash is below the session target
//! - `mining.extranonce.subscribe`: acknowledged
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  {"id":1,"method":"mining.subscribe","params":["miner/1.0"]}
//! Response: {"id":1,"result":[[["mining.set_difficulty","0000000000000001"],["mining.notify","0000000000000001"]],"00000001",4],"error":null}
//!
//! Request:  {"id":2,"method":"mining.foo","params":[]}
//! Response: {"id":2,"result":null,"error":[20,"Unknown method",null]}
//! ```

pub mod handler;
pub mod parser;
pub mod state;

pub use handler::handle_connection;
pub use parser::{Request, RequestId, Response, RpcError};
pub use state::{Backend, Session, SessionSettings, StateMachine};
