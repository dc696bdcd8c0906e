//! Protocol implementations.
//!
//! - `stratum`: Stratum v1 mining protocol spoken by clients

pub mod stratum;
