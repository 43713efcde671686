//! House registry chaincode and a local peer to run it.
//!
//! * [`contracts`] — the registry itself: record type, function dispatch and
//!   handlers for create, query, list and owner transfer.
//! * [`ledger`] — the stub interface chaincode sees, plus an in-memory world
//!   state with buffered per-transaction writes and a SHA-256 state root.
//! * [`host`] — runs one invocation per transaction, committing only on
//!   success.
//! * [`store`] — JSON snapshot persistence for the world state.
//! * [`config`] — command-line options.

pub mod config;
pub mod contracts;
pub mod host;
pub mod ledger;
pub mod store;

pub use contracts::{ContractError, House, HouseContract, Response};
pub use host::{Chaincode, Invocation, Peer};
pub use ledger::{ChaincodeStub, LedgerError, WorldState};
