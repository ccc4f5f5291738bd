pub mod config;
pub mod crypto;
pub mod policy;
pub mod pvt_repr;
pub mod request;
