pub mod domain;
pub mod error;
pub mod participant;
pub mod protocol;
