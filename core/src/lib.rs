pub mod attach;
pub mod audit;
pub mod auth;
pub mod conditions;
pub mod dns;
pub mod egress;
pub mod error;
pub mod namegen;
pub mod patch;
pub mod podspec;
pub mod run;
pub mod session;

pub use error::Error;
