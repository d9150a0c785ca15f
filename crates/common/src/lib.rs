// docket-common: presence and sync data model shared by the Docket crates

pub mod identity;
pub mod types;
