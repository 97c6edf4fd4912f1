// Core modules implementing table storage, validation, transactions, and errors.
pub mod backup;
pub mod catalog;
pub mod codec;
pub mod error;
pub mod schema;
pub mod table;
pub mod txn;
pub mod value;
