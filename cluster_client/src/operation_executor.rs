mod operation_context;
mod operation_executor_error;
mod operation_executor_handle;

pub use operation_context::*;
pub use operation_executor_error::*;
pub use operation_executor_handle::*;
