mod activation;
mod activity;
mod buffer;
mod condition;
mod dispatch;
mod envelope;
mod heap;
mod instance;
mod kernel;
mod object;
mod value;
mod variable;

pub use activation::*;
pub use activity::*;
pub use buffer::*;
pub use condition::*;
pub use dispatch::*;
pub use envelope::*;
pub use heap::*;
pub use instance::*;
pub use kernel::*;
pub use object::*;
pub use value::*;
pub use variable::*;
