#[macro_use]
extern crate serde;

#[macro_use]
extern crate log;

mod api;
mod arithmetic;
mod audit;
mod audit_sync;
mod authority;
mod error;
mod scrutiny;
mod serde_hex;
mod store;
mod transparency;
mod urn;
mod util;
mod vault;
mod voter;

pub use api::*;
pub use arithmetic::*;
pub use audit::*;
pub use audit_sync::*;
pub use authority::*;
pub use error::*;
pub use scrutiny::*;
pub use serde_hex::*;
pub use store::*;
pub use transparency::*;
pub use urn::*;
pub use util::*;
pub use vault::*;
pub use voter::*;

#[cfg(test)]
mod tests;
