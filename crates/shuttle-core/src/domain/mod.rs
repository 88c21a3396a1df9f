//! Domain model: ids, typed variables, the claimed task, execution results,
//! and retry accounting.

pub mod ids;
pub mod result;
pub mod retry;
pub mod task;
pub mod variables;

pub use ids::{TaskId, Topic, WorkerId};
pub use result::{ExecutionResult, ResultKind};
pub use retry::RetryPolicy;
pub use task::{ExternalTask, TaskContext};
pub use variables::{
    FromVariable, VariableError, VariableValue, Variables, variables, variables_to_json,
};
