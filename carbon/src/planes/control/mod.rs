//! Control plane: owning the backend connections and the bounded worker
//! pool used for status queries.

mod pool;
mod workers;

pub use pool::ConnectionPool;
pub use workers::QueryWorkers;
