// src/lib.rs — Library root for plugbox

pub mod cli;
pub mod infra;
pub mod sandbox;
