//! Task abstraction and the worker pool executing tasks

pub mod pool;
pub mod task;

pub use pool::Dispatcher;
pub use task::{ContainerOp, MaintenanceOp, Task, TaskContext, TaskQueue, WaitGroup};
