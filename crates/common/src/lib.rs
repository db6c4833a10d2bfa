// folio-common: shared types and errors for the Folio workspace

pub mod error;
pub mod types;
