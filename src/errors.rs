use crate::txn::Key;

pub type Result<T> = std::result::Result<T, TxnError>;

#[derive(thiserror::Error, Debug)]
pub enum TxnError {
    #[error("transaction processor is closed")]
    Closed,
    #[error("key {0} appears in both the read set and the write set")]
    KeyInBothSets(Key),
    #[error("{0}")]
    Internal(String),
}
