use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::contracts::Response;
use crate::ledger::{ChaincodeStub, TxContext, TxId, WorldState};

/// Entry points the peer calls on installed chaincode.
pub trait Chaincode {
    /// Called once when the chaincode is instantiated on the channel.
    fn init(&self, stub: &mut dyn ChaincodeStub) -> Response;

    fn invoke(&self, stub: &mut dyn ChaincodeStub, function: &str, args: &[String]) -> Response;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Invocation {
    pub function: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(function: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            function: function.into(),
            args,
        }
    }

    /// Splits a raw parameter list: the first element names the function,
    /// the rest are its arguments.
    pub fn from_parameters(mut params: Vec<String>) -> Option<Self> {
        if params.is_empty() {
            return None;
        }
        let function = params.remove(0);
        Some(Self::new(function, params))
    }

    pub fn tx_id(&self, height: u64) -> TxId {
        transaction_id(height, &self.function, &self.args)
    }
}

fn transaction_id(height: u64, function: &str, args: &[String]) -> TxId {
    let mut hasher = Sha256::new();
    hasher.update(height.to_le_bytes());
    for part in std::iter::once(function).chain(args.iter().map(String::as_str)) {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.finalize().into()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxReceipt {
    #[serde(with = "crate::ledger::serde_digest")]
    pub tx_id: TxId,
    pub function: String,
    pub committed: bool,
    pub writes: usize,
}

/// Local stand-in for a peer: runs each call in its own transaction over a
/// [`WorldState`].
#[derive(Debug, Default)]
pub struct Peer<C> {
    chaincode: C,
}

impl<C: Chaincode> Peer<C> {
    pub fn new(chaincode: C) -> Self {
        Self { chaincode }
    }

    pub fn instantiate(&self, state: &mut WorldState) -> (Response, TxReceipt) {
        self.run(state, "init", &[], true, |cc, stub| cc.init(stub))
    }

    /// Executes and, if the chaincode reports success, commits.
    pub fn invoke(&self, state: &mut WorldState, invocation: &Invocation) -> (Response, TxReceipt) {
        self.run(
            state,
            &invocation.function,
            &invocation.args,
            true,
            |cc, stub| cc.invoke(stub, &invocation.function, &invocation.args),
        )
    }

    /// Executes without ever committing.
    pub fn query(&self, state: &mut WorldState, invocation: &Invocation) -> (Response, TxReceipt) {
        self.run(
            state,
            &invocation.function,
            &invocation.args,
            false,
            |cc, stub| cc.invoke(stub, &invocation.function, &invocation.args),
        )
    }

    fn run<F>(
        &self,
        state: &mut WorldState,
        function: &str,
        args: &[String],
        commit: bool,
        call: F,
    ) -> (Response, TxReceipt)
    where
        F: FnOnce(&C, &mut dyn ChaincodeStub) -> Response,
    {
        let tx_id = transaction_id(state.height(), function, args);
        let (response, writes) = {
            let mut ctx = TxContext::new(state);
            let stub: &mut dyn ChaincodeStub = &mut ctx;
            let response = call(&self.chaincode, stub);
            (response, ctx.into_write_set())
        };

        let leaked = state.open_scans();
        if leaked > 0 {
            warn!(function, leaked, "chaincode left range scans open");
        }

        let mut receipt = TxReceipt {
            tx_id,
            function: function.to_string(),
            committed: false,
            writes: writes.len(),
        };
        if commit && response.is_ok() {
            state.apply(writes, tx_id);
            receipt.committed = true;
            info!(
                tx_id = %hex::encode(tx_id),
                function,
                writes = receipt.writes,
                height = state.height(),
                "transaction committed"
            );
        } else if !response.is_ok() {
            warn!(
                tx_id = %hex::encode(tx_id),
                function,
                message = %response.message,
                "transaction discarded"
            );
        }
        (response, receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::HouseContract;

    fn inv(params: &[&str]) -> Invocation {
        Invocation::from_parameters(params.iter().map(|p| p.to_string()).collect()).unwrap()
    }

    #[test]
    fn from_parameters_splits_function_and_args() {
        let invocation = inv(&["changeHouseOwner", "HOUSE1", "Alice"]);
        assert_eq!(invocation.function, "changeHouseOwner");
        assert_eq!(invocation.args, vec!["HOUSE1", "Alice"]);
        assert!(Invocation::from_parameters(Vec::new()).is_none());
    }

    #[test]
    fn tx_id_depends_on_height_and_argument_boundaries() {
        let a = inv(&["createHouse", "ab", "c"]);
        let b = inv(&["createHouse", "a", "bc"]);
        assert_ne!(a.tx_id(0), b.tx_id(0));
        assert_ne!(a.tx_id(0), a.tx_id(1));
        assert_eq!(a.tx_id(3), a.tx_id(3));
    }

    #[test]
    fn successful_invoke_commits_and_advances_height() {
        let peer = Peer::new(HouseContract);
        let mut state = WorldState::new();
        let (response, receipt) = peer.invoke(&mut state, &inv(&["initLedger"]));
        assert!(response.is_ok());
        assert!(receipt.committed);
        assert_eq!(receipt.writes, 10);
        assert_eq!(state.height(), 1);
        assert_eq!(state.last_tx_id(), Some(receipt.tx_id));
        assert_eq!(state.len(), 10);
    }

    #[test]
    fn failed_invoke_leaves_state_untouched() {
        let peer = Peer::new(HouseContract);
        let mut state = WorldState::new();
        peer.invoke(&mut state, &inv(&["initLedger"]));
        let root = state.state_root();

        let (response, receipt) = peer.invoke(&mut state, &inv(&["createHouse", "HOUSE1", "1"]));
        assert!(!response.is_ok());
        assert!(!receipt.committed);
        assert_eq!(receipt.writes, 0);
        assert_eq!(state.height(), 1);
        assert_eq!(state.state_root(), root);
    }

    #[test]
    fn query_never_commits() {
        let peer = Peer::new(HouseContract);
        let mut state = WorldState::new();
        let (response, receipt) = peer.query(
            &mut state,
            &inv(&["createHouse", "HOUSE1", "1", "2", "3", "Ann"]),
        );
        assert!(response.is_ok());
        assert!(!receipt.committed);
        assert_eq!(receipt.writes, 1);
        assert!(state.is_empty());
        assert_eq!(state.height(), 0);
    }

    #[test]
    fn instantiate_commits_empty_transaction() {
        let peer = Peer::new(HouseContract);
        let mut state = WorldState::new();
        let (response, receipt) = peer.instantiate(&mut state);
        assert!(response.is_ok());
        assert_eq!(receipt.function, "init");
        assert_eq!(receipt.writes, 0);
        assert!(state.is_empty());
        assert_eq!(state.height(), 1);
    }

    #[test]
    fn listing_through_peer_releases_scans() {
        let peer = Peer::new(HouseContract);
        let mut state = WorldState::new();
        peer.invoke(&mut state, &inv(&["initLedger"]));
        let (response, _) = peer.query(&mut state, &inv(&["queryAllHouses"]));
        assert!(response.is_ok());
        assert_eq!(state.open_scans(), 0);
    }

    /// Writes, then reports failure: nothing may reach the world state.
    struct WriteThenFail;

    impl Chaincode for WriteThenFail {
        fn init(&self, _stub: &mut dyn ChaincodeStub) -> Response {
            Response::success(Vec::new())
        }

        fn invoke(&self, stub: &mut dyn ChaincodeStub, _function: &str, _args: &[String]) -> Response {
            if let Err(err) = stub.put_state("HOUSE0", b"{}".to_vec()) {
                return Response::error(err.to_string());
            }
            Response::error("late failure")
        }
    }

    #[test]
    fn partial_writes_of_failed_invocation_are_discarded() {
        let peer = Peer::new(WriteThenFail);
        let mut state = WorldState::new();
        let (response, receipt) = peer.invoke(&mut state, &inv(&["anything"]));
        assert_eq!(response.message, "late failure");
        assert_eq!(receipt.writes, 1);
        assert!(!receipt.committed);
        assert!(state.get("HOUSE0").is_none());
    }
}
