pub mod constant;
pub mod error;
pub mod fs;
pub mod http;
pub mod mysql;
mod opts;
pub mod promise;
pub mod protocol;
pub mod runtime;

mod col;
mod row;
mod value;

pub use col::Column;
pub use error::{Error, Result};
pub use opts::Opts;
pub use promise::{CancellablePromise, FiberMutex, Promise, Settler};
pub use row::{OkInfo, QueryOutcome, ResultSet, Row};
pub use runtime::{EventLoop, Handle, LoopConfig};
pub use value::{Param, SqlValue};
