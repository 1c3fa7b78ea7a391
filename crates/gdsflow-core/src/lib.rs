pub mod action;
pub mod aggregate;
pub mod campaign;
pub mod error;
pub mod graph;
pub mod io;
pub mod metrics;
pub mod paths;
pub mod process;
pub mod scheduler;
pub mod template;
pub mod toolchain;

pub use error::{FlowError, Result};
