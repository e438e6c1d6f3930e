// src/models/mod.rs
pub mod driver;
pub mod messages;
pub mod order;
pub mod user;
pub mod wallet;

pub use driver::*;
pub use messages::*;
pub use order::*;
pub use user::*;
pub use wallet::*;
