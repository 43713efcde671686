use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tracing::{debug, info, warn};

use crate::host::Chaincode;
use crate::ledger::{ChaincodeStub, Key, LedgerError, StateQueryIterator};

/// Bounds of the `queryAllHouses` scan. Keys outside this string range are
/// never listed, whatever their suffix.
pub const RANGE_START: &str = "HOUSE0";
pub const RANGE_END: &str = "HOUSE999";

const KEY_PREFIX: &str = "HOUSE";

/// A registered house. Every field is opaque text; nothing is parsed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct House {
    pub year: String,
    #[serde(rename = "squarefeets")]
    pub area: String,
    pub location: String,
    pub owner: String,
}

impl House {
    pub fn new(
        year: impl Into<String>,
        area: impl Into<String>,
        location: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            year: year.into(),
            area: area.into(),
            location: location.into(),
            owner: owner.into(),
        }
    }
}

/// Records written by `initLedger`, stored under `HOUSE0`..`HOUSE9`.
pub fn seed_houses() -> Vec<House> {
    vec![
        House::new("2007", "300", "Bayonne", "Tomoko"),
        House::new("1987", "178", "Anglet", "Brad"),
        House::new("1865", "37", "Bayonne", "Jin Soo"),
        House::new("1999", "467", "Anglet", "Max"),
        House::new("2007", "2534", "Bayonne", "Adriana"),
        House::new("1999", "205", "purple", "Michel"),
        House::new("2002", "300", "Biarritz", "Aarav"),
        House::new("2007", "300", "Biarritz", "Pari"),
        House::new("1989", "125", "Bayonne", "Valeria"),
        House::new("2007", "125", "Arruntz", "Shotaro"),
    ]
}

#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("Incorrect number of arguments. Expecting {expected}")]
    ArgumentCount { expected: usize, actual: usize },
    #[error("Invalid Smart Contract function name.")]
    UnknownFunction(String),
    #[error("{0}")]
    Iterator(#[source] LedgerError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("record at {key} is not valid JSON: {source}")]
    Decode {
        key: Key,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A parsed invocation: the function name resolved and its positional
/// arguments checked and bound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Function {
    InitLedger,
    CreateHouse { key: Key, house: House },
    QueryHouse { key: Key },
    QueryAllHouses,
    ChangeHouseOwner { key: Key, new_owner: String },
}

impl Function {
    pub fn parse(name: &str, args: &[String]) -> Result<Self, ContractError> {
        match name {
            "queryHouse" => {
                let [key] = expect_args(args)?;
                Ok(Function::QueryHouse { key })
            }
            "initLedger" => Ok(Function::InitLedger),
            "createHouse" => {
                let [key, year, area, location, owner] = expect_args(args)?;
                Ok(Function::CreateHouse {
                    key,
                    house: House {
                        year,
                        area,
                        location,
                        owner,
                    },
                })
            }
            "queryAllHouses" => Ok(Function::QueryAllHouses),
            "changeHouseOwner" => {
                let [key, new_owner] = expect_args(args)?;
                Ok(Function::ChangeHouseOwner { key, new_owner })
            }
            other => Err(ContractError::UnknownFunction(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::InitLedger => "initLedger",
            Function::CreateHouse { .. } => "createHouse",
            Function::QueryHouse { .. } => "queryHouse",
            Function::QueryAllHouses => "queryAllHouses",
            Function::ChangeHouseOwner { .. } => "changeHouseOwner",
        }
    }
}

fn expect_args<const N: usize>(args: &[String]) -> Result<[String; N], ContractError> {
    <[String; N]>::try_from(args.to_vec()).map_err(|given: Vec<String>| {
        ContractError::ArgumentCount {
            expected: N,
            actual: given.len(),
        }
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok = 200,
    Error = 500,
}

/// Outcome of one invocation as seen by the calling application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub message: String,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn success(payload: Vec<u8>) -> Self {
        Self {
            status: Status::Ok,
            message: String::new(),
            payload,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: message.into(),
            payload: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

impl From<Result<Vec<u8>, ContractError>> for Response {
    fn from(outcome: Result<Vec<u8>, ContractError>) -> Self {
        match outcome {
            Ok(payload) => Response::success(payload),
            Err(err) => Response::error(err.to_string()),
        }
    }
}

/// The house registry chaincode.
#[derive(Clone, Copy, Debug, Default)]
pub struct HouseContract;

impl Chaincode for HouseContract {
    fn init(&self, _stub: &mut dyn ChaincodeStub) -> Response {
        Response::success(Vec::new())
    }

    fn invoke(&self, stub: &mut dyn ChaincodeStub, function: &str, args: &[String]) -> Response {
        let outcome = Function::parse(function, args).and_then(|f| self.execute(stub, f));
        if let Err(err) = &outcome {
            warn!(function, error = %err, "invocation failed");
        }
        outcome.into()
    }
}

impl HouseContract {
    pub fn execute(
        &self,
        stub: &mut dyn ChaincodeStub,
        function: Function,
    ) -> Result<Vec<u8>, ContractError> {
        debug!(function = function.name(), "dispatching");
        match function {
            Function::InitLedger => init_ledger(stub).map(|()| Vec::new()),
            Function::CreateHouse { key, house } => {
                put_house(stub, &key, &house).map(|()| Vec::new())
            }
            Function::QueryHouse { key } => Ok(stub.get_state(&key)?),
            Function::QueryAllHouses => query_all_houses(stub),
            Function::ChangeHouseOwner { key, new_owner } => {
                change_house_owner(stub, &key, new_owner).map(|()| Vec::new())
            }
        }
    }
}

fn init_ledger(stub: &mut dyn ChaincodeStub) -> Result<(), ContractError> {
    for (i, house) in seed_houses().iter().enumerate() {
        let key = format!("{KEY_PREFIX}{i}");
        put_house(stub, &key, house)?;
        debug!(%key, owner = %house.owner, "seeded house");
    }
    info!("ledger seeded");
    Ok(())
}

fn put_house(stub: &mut dyn ChaincodeStub, key: &str, house: &House) -> Result<(), ContractError> {
    let bytes = serde_json::to_vec(house).map_err(ContractError::Encode)?;
    stub.put_state(key, bytes)?;
    Ok(())
}

/// An absent record reads back as empty bytes and decodes to the zero
/// record. Anything else must be a well-formed house.
fn decode_house(key: &str, bytes: &[u8]) -> Result<House, ContractError> {
    if bytes.is_empty() {
        return Ok(House::default());
    }
    serde_json::from_slice(bytes).map_err(|source| ContractError::Decode {
        key: key.to_string(),
        source,
    })
}

fn change_house_owner(
    stub: &mut dyn ChaincodeStub,
    key: &str,
    new_owner: String,
) -> Result<(), ContractError> {
    let bytes = stub.get_state(key)?;
    let mut house = decode_house(key, &bytes)?;
    house.owner = new_owner;
    put_house(stub, key, &house)
}

#[derive(Serialize)]
struct QueryResult<'a> {
    #[serde(rename = "Key")]
    key: &'a str,
    #[serde(rename = "Record")]
    record: &'a RawValue,
}

fn query_all_houses(stub: &dyn ChaincodeStub) -> Result<Vec<u8>, ContractError> {
    let mut scan = ScanGuard(
        stub.get_state_by_range(RANGE_START, RANGE_END)
            .map_err(ContractError::Iterator)?,
    );

    let mut entries = Vec::new();
    while scan.0.has_next() {
        entries.push(scan.0.next_entry().map_err(ContractError::Iterator)?);
    }

    let mut results = Vec::with_capacity(entries.len());
    for kv in &entries {
        let record: &RawValue =
            serde_json::from_slice(&kv.value).map_err(|source| ContractError::Decode {
                key: kv.key.clone(),
                source,
            })?;
        results.push(QueryResult {
            key: &kv.key,
            record,
        });
    }

    let payload = serde_json::to_vec(&results).map_err(ContractError::Encode)?;
    debug!(records = results.len(), "queryAllHouses");
    Ok(payload)
}

/// Closes the wrapped scan when dropped, on success and error paths alike.
struct ScanGuard<'a>(Box<dyn StateQueryIterator + 'a>);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.0.close() {
            warn!(error = %err, "failed to close range scan");
        }
    }
}
