pub mod persistent;

pub use persistent::PersistentStateDB;
