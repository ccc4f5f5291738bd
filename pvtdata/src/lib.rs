pub mod chaincode;
pub mod client;
pub mod network;
pub mod ordering;
pub mod server;
pub mod shared;
